use std::path::PathBuf;

use clap::Parser;
use vmm::config::VMMConfig;
use vmm::devices::display::NullDisplay;
use vmm::VMM;

#[derive(Parser)]
#[clap(version = "0.1", about = "SMP emulator for a 64-bit fictional guest ISA")]
struct VestaOpts {
    /// Boot image path
    #[clap(short, long, default_value = "boot.bin")]
    bin: PathBuf,

    /// Number of guest cores (1-64)
    #[clap(short, long, default_value = "1")]
    smp: usize,

    /// Guest memory size in MiB
    #[clap(short, long, default_value = "4")]
    memory: u32,

    /// Disk image path (created and zero-filled if missing)
    #[clap(short, long, default_value = "disk.img")]
    disk: PathBuf,

    /// Run the built-in headless self tests and exit
    #[clap(long)]
    selftest: bool,
}

#[derive(Debug)]
pub enum Error {
    VmmConfigure(vmm::Error),

    VmmRun(vmm::Error),

    Selftest(vmm::Error),
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: VestaOpts = VestaOpts::parse();

    if opts.selftest {
        vmm::selftest::run_all().map_err(Error::Selftest)?;
        log::info!("all self tests passed");
        return Ok(());
    }

    let cfg = VMMConfig {
        image: opts.bin,
        disk: opts.disk,
        cores: opts.smp,
        memory_bytes: opts.memory.saturating_mul(1024 * 1024),
    };

    // Create and configure the VMM:
    // * Guest memory, framebuffer and MMIO windows
    // * The boot image applied to RAM
    // * The disk worker
    // * One vcpu per guest core
    let mut vmm = VMM::new();
    vmm.configure(&cfg).map_err(Error::VmmConfigure)?;

    // Run with the headless display backend; a windowed surface can be
    // swapped in by linking one that implements DisplaySurface.
    vmm.run(Box::new(NullDisplay::default()))
        .map_err(Error::VmmRun)?;

    Ok(())
}
