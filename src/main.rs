use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use transfer_bench::bench::{BenchmarkError, BenchmarkOptions, TransferBenchmark, TransferDevice};
use transfer_bench::common::FatalKind;
use transfer_bench::config::{self, BenchConfig, BENCH_CONFIG_FILENAME};
use transfer_bench::gpu::device::ProvisionError;
use transfer_bench::gpu::instance::InstanceError;
use transfer_bench::gpu::physical_device::PhysicalDeviceError;
use transfer_bench::gpu::{enumerate_physical_devices, provision, select_physical_device};
use transfer_bench::gpu::{InstanceOptions, LogSink, VulkanInstance};
use transfer_bench::logger::init_logger;
use transfer_bench::report::{describe_device, format_capabilities, OutputFormat, SampleWriter};
use transfer_bench::stopwatch::InstantStopwatch;

#[derive(Parser, Debug)]
#[command(version, about = "Measures host-to-device copy time on a Vulkan queue, 4 bytes and up")]
struct Args {
    /// RON config file. Missing is fine; defaults are used.
    #[arg(long, default_value = BENCH_CONFIG_FILENAME)]
    config: PathBuf,
    /// Physical device ordinal.
    #[arg(long)]
    device: Option<usize>,
    /// Which configured queue to benchmark.
    #[arg(long)]
    queue: Option<usize>,
    /// Largest transfer in bytes, inclusive.
    #[arg(long)]
    max_size: Option<u64>,
    #[arg(long)]
    validation: bool,
    /// Stop at the device's maximum allocation size.
    #[arg(long)]
    clamp_to_device_limit: bool,
    #[arg(long)]
    csv: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Print every physical device and exit.
    #[arg(long)]
    list_devices: bool,
    /// More logging; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut BenchConfig) {
        if let Some(device) = self.device {
            config.device_index = device;
        }
        if let Some(queue) = self.queue {
            config.benchmark_queue = queue;
        }
        if let Some(max_size) = self.max_size {
            config.max_transfer_size = max_size;
        }
        config.validation |= self.validation;
        config.clamp_to_device_limit |= self.clamp_to_device_limit;
        if self.csv {
            config.output = OutputFormat::Csv;
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    PhysicalDevice(#[from] PhysicalDeviceError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Benchmark(#[from] BenchmarkError),
    #[error("Could not write output: {0}")]
    Output(#[from] std::io::Error),
}

impl RunError {
    fn kind(&self) -> FatalKind {
        match self {
            RunError::Instance(e) => e.kind(),
            RunError::PhysicalDevice(e) => e.kind(),
            RunError::Provision(e) => e.kind(),
            RunError::Benchmark(e) => e.kind(),
            RunError::Output(_) => FatalKind::Resource,
        }
    }
}

/// Device and queue notes go to stdout in text mode and to the log in CSV
/// mode, so CSV output stays machine-readable.
fn announce(format: OutputFormat, message: String) {
    match format {
        OutputFormat::Text => println!("{}", message),
        OutputFormat::Csv => info!("{}", message),
    }
}

fn run(args: &Args, config: &BenchConfig) -> Result<(), RunError> {
    let options = InstanceOptions {
        validation: config.validation,
        ..InstanceOptions::default()
    };
    let instance = Arc::new(VulkanInstance::new(&options, Box::new(LogSink))?);

    if args.list_devices {
        let devices = enumerate_physical_devices(&instance)?;
        let mut out = std::io::stdout().lock();
        for device in &devices {
            write!(out, "{}", describe_device(device))?;
        }
        return Ok(());
    }

    let physical = select_physical_device(&instance, config.device_index)?;
    announce(config.output, format!("Using physical device: {}", physical.name));

    let device = provision(&instance, &physical, &config.queue_requests())?;
    let benchmark = TransferBenchmark::with_options(
        &device,
        config.benchmark_queue,
        BenchmarkOptions {
            max_transfer_size: config.max_transfer_size,
            clamp_to_device_limit: config.clamp_to_device_limit,
        },
        InstantStopwatch::new(),
    )?;
    announce(
        config.output,
        format!(
            "Queue {} (family {}) capabilities: {}",
            benchmark.queue_index(),
            benchmark.queue_family_index(),
            format_capabilities(device.queue_capabilities(benchmark.queue_index()))
        ),
    );

    let mut writer = SampleWriter::new(std::io::stdout().lock(), config.output);
    for sample in benchmark {
        writer.write_sample(&sample?)?;
    }
    drop(writer);

    device.teardown();
    Ok(())
}

fn main() {
    let args = Args::parse();

    // Loaded before logging exists so a configured log file can be honored;
    // problems are reported once the logger is up.
    let loaded = config::load_config(&args.config);
    let log_file = args
        .log_file
        .clone()
        .or_else(|| loaded.as_ref().ok().and_then(|config| config.log_file.clone()));
    if let Err(e) = init_logger(args.verbose, log_file.as_deref()) {
        eprintln!("{}", e);
        std::process::exit(e.kind().exit_code());
    }

    let mut config = config::or_default(&args.config, loaded);
    args.apply(&mut config);

    if let Err(e) = run(&args, &config) {
        error!("Fatal ({}): {}", e.kind(), e);
        std::process::exit(e.kind().exit_code());
    }
}
