//! Aquarium streaming benchmark
//!
//! Drives the render-loop side of the streaming subsystem without a GPU:
//! a school of fish swims through a tank, every frame their transforms
//! are reserved, written and flushed through the selected upload policy,
//! and the instance resources grow whenever the population does. Reports
//! allocator statistics and throughput at exit.

use std::error::Error;
use std::time::Instant;

use nalgebra::{Matrix4, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use aquarium_engine::foundation::logging;
use aquarium_engine::{
    new_streaming_allocator, AquariumConfig, BindMode, GpuDevice, HeadlessDevice,
    InstanceResources, BUFFER_PER_ALLOCATE_SIZE,
};

/// Half-extent of the cubic tank the fish bounce around in
const TANK_HALF_EXTENT: f32 = 20.0;

/// Fixed simulation timestep (seconds per frame)
const TIME_STEP: f32 = 1.0 / 60.0;

struct Fish {
    position: Vector3<f32>,
    velocity: Vector3<f32>,
}

impl Fish {
    fn spawn(rng: &mut StdRng) -> Self {
        let position = Vector3::new(
            rng.gen_range(-TANK_HALF_EXTENT..TANK_HALF_EXTENT),
            rng.gen_range(-TANK_HALF_EXTENT..TANK_HALF_EXTENT),
            rng.gen_range(-TANK_HALF_EXTENT..TANK_HALF_EXTENT),
        );
        let velocity = Vector3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-2.0..2.0),
        );
        Self { position, velocity }
    }

    fn update(&mut self) {
        self.position += self.velocity * TIME_STEP;
        for axis in 0..3 {
            if self.position[axis].abs() > TANK_HALF_EXTENT {
                self.position[axis] = self.position[axis].clamp(-TANK_HALF_EXTENT, TANK_HALF_EXTENT);
                self.velocity[axis] = -self.velocity[axis];
            }
        }
    }

    fn transform(&self) -> Matrix4<f32> {
        let yaw = self.velocity.x.atan2(self.velocity.z);
        Matrix4::new_translation(&self.position) * Matrix4::new_rotation(Vector3::y() * yaw)
    }
}

fn parse_args(mut config: AquariumConfig) -> Result<AquariumConfig, Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--num-fish" => config.num_fish = value("--num-fish")?.parse()?,
            "--frames" => config.frames = value("--frames")?.parse()?,
            "--pool-cap" => config.pool_capacity = value("--pool-cap")?.parse()?,
            "--ramp-interval" => config.ramp_interval = value("--ramp-interval")?.parse()?,
            "--ramp-step" => config.ramp_step = value("--ramp-step")?.parse()?,
            "--seed" => config.seed = value("--seed")?.parse()?,
            "--sync-uploads" => config.prefer_sync_upload = true,
            "--per-instance-bind-groups" => config.per_instance_bind_groups = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }
    Ok(config)
}

fn print_usage() {
    println!(
        "aquarium_bench [options]\n\
         \n\
         Options (override aquarium.toml when present):\n\
           --num-fish <n>               starting population (default 500)\n\
           --frames <n>                 frames to simulate (default 300)\n\
           --sync-uploads               one-shot synchronous upload buffers\n\
           --pool-cap <bytes>           sync pool byte cap (default 1 MiB)\n\
           --per-instance-bind-groups   one bind group per fish\n\
           --ramp-interval <frames>     grow the school every n frames\n\
           --ramp-step <n>              fish added per ramp step\n\
           --seed <n>                   placement seed"
    );
}

fn run(config: &AquariumConfig) -> Result<(), Box<dyn Error>> {
    let mut device = HeadlessDevice::new();
    let bind_mode = if config.per_instance_bind_groups {
        BindMode::PerInstance
    } else {
        BindMode::DynamicOffset
    };
    let instance_size = std::mem::size_of::<[[f32; 4]; 4]>() as u64;
    let mut resources = InstanceResources::new(bind_mode, instance_size);
    let mut allocator = new_streaming_allocator(config.upload_mode(), config.pool_capacity);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut school: Vec<Fish> = (0..config.num_fish).map(|_| Fish::spawn(&mut rng)).collect();

    log::info!(
        "streaming {} fish for {} frames ({:?} uploads, {:?} bindings)",
        school.len(),
        config.frames,
        config.upload_mode(),
        bind_mode
    );

    let start = Instant::now();
    let mut skipped_frames = 0u64;

    for frame in 0..config.frames {
        if config.ramp_interval > 0 && frame > 0 && frame % config.ramp_interval == 0 {
            for _ in 0..config.ramp_step {
                school.push(Fish::spawn(&mut rng));
            }
        }

        let count = u32::try_from(school.len())?;
        if count == 0 {
            continue;
        }
        // Growth failure is fatal by design; `?` tears the process down.
        resources.ensure_capacity(&mut device, count)?;
        let dst = resources
            .buffer()
            .ok_or("instance resources empty with a non-zero population")?;

        for fish in &mut school {
            fish.update();
        }

        // One reservation cannot exceed the fixed staging buffer size, so
        // large schools are uploaded in chunks of at most that many
        // instances; the async policy recycles or blocks between chunks.
        let chunk_instances = usize::try_from(BUFFER_PER_ALLOCATE_SIZE / resources.stride())?;
        for (chunk_index, chunk) in school.chunks(chunk_instances).enumerate() {
            let base = chunk_index * chunk_instances;
            let bytes = resources.stride() * chunk.len() as u64;
            match allocator.allocate(&mut device, bytes)? {
                Some(alloc) => {
                    for (slot, fish) in chunk.iter().enumerate() {
                        let instance = u32::try_from(base + slot)?;
                        let cells: [[f32; 4]; 4] = fish.transform().into();
                        allocator.push(
                            &mut device,
                            alloc.ring,
                            dst,
                            alloc.offset + resources.stride() * slot as u64,
                            resources.instance_offset(instance),
                            bytemuck::bytes_of(&cells),
                        )?;
                    }
                }
                None => {
                    // Pool exhausted: last frame's transforms stay on screen.
                    skipped_frames += 1;
                    break;
                }
            }
        }

        allocator.flush(&mut device)?;
        device.poll()?;
    }

    let elapsed = start.elapsed();
    let stats = allocator.stats().clone();
    log::info!(
        "{} frames in {:.2?} ({:.0} fps equivalent), {} fish at exit",
        config.frames,
        elapsed,
        config.frames as f64 / elapsed.as_secs_f64(),
        school.len()
    );
    log::info!(
        "buffers: {} created, {} recycled, {} retired with space, {} blocked waits",
        stats.buffers_created,
        stats.buffers_recycled,
        stats.retired_with_space,
        stats.blocked_allocations
    );
    log::info!(
        "streamed {} bytes, {} exhausted allocations, {} skipped frames, {} reallocations",
        stats.bytes_streamed,
        stats.exhausted_allocations,
        skipped_frames,
        resources.reallocations()
    );

    allocator.destroy(&mut device);
    resources.destroy(&mut device);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init();

    let base = if std::path::Path::new("aquarium.toml").exists() {
        AquariumConfig::from_file("aquarium.toml")?
    } else {
        AquariumConfig::default()
    };
    let config = parse_args(base)?;

    run(&config)
}
