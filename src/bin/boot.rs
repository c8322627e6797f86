//! Boot the fixed guest program in a fresh VM and report its final
//! register state.
//!
//! Usage: cargo run --bin boot

use picovm::payload;
use picovm::vm::{PicoVm, VmConfig};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    std::process::exit(boot(VmConfig::default()));
}

fn boot(config: VmConfig) -> i32 {
    log::info!(
        "Creating VM with {} bytes of guest memory at {:#x}",
        config.memory_size,
        config.guest_base,
    );

    let mut vm = match PicoVm::new(config) {
        Ok(vm) => vm,
        Err(e) => {
            log::error!("Failed to create VM: {}", e);
            return 1;
        }
    };

    if let Err(e) = vm.load_payload(payload::ADD_AND_HALT) {
        log::error!("Failed to load the guest program: {}", e);
        return 1;
    }

    match vm.run() {
        Ok(report) => {
            println!(
                "Halt: rax={:#x} rbx={:#x} rip={:#x}",
                report.rax, report.rbx, report.rip,
            );
            0
        }
        Err(e) => {
            log::error!("VM failed in state {}: {}", vm.state(), e);
            1
        }
    }
}
