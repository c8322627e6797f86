//! The bootstrap VM: one hypervisor session, one memory region, one vCPU.
//!
//! Construction acquires resources in dependency order (device, VM,
//! memory, vCPU) and teardown is the reverse, driven by drop order, so
//! no path out of the run loop can leak a handle or a mapping.

use crate::cpu::{self, CpuError};
use crate::dispatch::{classify, ExitAction, FatalExit, VmState};
use crate::memory::{GuestRam, MemoryError};
use kvm_bindings::{kvm_run, KVM_API_VERSION};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use log::{debug, info};
use std::mem::size_of;
use thiserror::Error;

/// Default guest memory size: one 4 KiB page.
pub const DEFAULT_MEMORY_SIZE: usize = 0x1000;

/// Errors from building or running the VM.
#[derive(Error, Debug)]
pub enum VmError {
    /// The virtualization device could not be opened.
    #[error("Failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    /// The kernel speaks a different KVM API revision.
    #[error("Unsupported KVM API version {found} (need {expected})")]
    ApiVersion {
        /// Version the kernel reported.
        found: i32,
        /// Version this crate is written against.
        expected: u32,
    },

    /// The run-state mapping size query failed.
    #[error("Failed to query the vCPU run-state mapping size: {0}")]
    RunStateSize(#[source] kvm_ioctls::Error),

    /// The kernel reported a run-state mapping too small to hold the
    /// run structure.
    #[error("vCPU run-state mapping of {size} bytes is smaller than the {min} byte run structure")]
    RunStateTooSmall {
        /// Size the kernel reported.
        size: usize,
        /// Minimum usable size.
        min: usize,
    },

    /// VM creation failed.
    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    /// vCPU creation failed.
    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    /// Guest memory allocation, loading, or registration failed.
    #[error("Guest memory: {0}")]
    Memory(#[from] MemoryError),

    /// Register programming or readback failed.
    #[error("vCPU state: {0}")]
    Cpu(#[from] CpuError),

    /// The run call itself failed at the OS level.
    #[error("Failed to run vCPU: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    /// The hypervisor could not enter the guest.
    #[error("VM entry failed on cpu {cpu}: hardware reason {hw_reason:#x}")]
    FailedEntry {
        /// Hardware entry failure reason.
        hw_reason: u64,
        /// vCPU the entry failed on.
        cpu: u32,
    },

    /// The hypervisor reported an internal error.
    #[error("KVM reported an internal error")]
    InternalError,

    /// The guest suspended for a reason outside the recognized table.
    #[error("Unhandled vCPU exit: {0}")]
    UnhandledExit(String),
}

impl From<FatalExit> for VmError {
    fn from(fatal: FatalExit) -> Self {
        match fatal {
            FatalExit::FailedEntry { hw_reason, cpu } => VmError::FailedEntry { hw_reason, cpu },
            FatalExit::InternalError => VmError::InternalError,
            FatalExit::Unrecognized(desc) => VmError::UnhandledExit(desc),
        }
    }
}

/// Construction parameters for [`PicoVm`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Guest memory size in bytes. Must be a positive multiple of the
    /// host page size.
    pub memory_size: usize,
    /// Guest physical base of the memory region, which is also the
    /// guest entry point (programs are loaded at offset 0).
    pub guest_base: u64,
    /// KVM memory slot backing the region.
    pub slot: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            guest_base: 0,
            slot: 0,
        }
    }
}

/// Final register values reported when the guest halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltReport {
    /// Accumulator register at the halt.
    pub rax: u64,
    /// Base register at the halt.
    pub rbx: u64,
    /// Instruction pointer at the halt (one past the `hlt` byte).
    pub rip: u64,
}

/// A fully assembled single-vCPU VM.
#[derive(Debug)]
pub struct PicoVm {
    // Field order fixes drop order: the vCPU (whose drop unmaps its
    // run-state buffer and closes its fd) goes first, then the guest
    // memory mapping, then the VM and device handles.
    vcpu: VcpuFd,
    memory: GuestRam,
    vm: VmFd,
    kvm: Kvm,
    config: VmConfig,
    state: VmState,
}

impl PicoVm {
    /// Open the virtualization device and bring up a VM with one
    /// registered memory region and one programmed vCPU.
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        let kvm = Kvm::new().map_err(VmError::KvmOpen)?;

        let api = kvm.get_api_version();
        if api != KVM_API_VERSION as i32 {
            return Err(VmError::ApiVersion {
                found: api,
                expected: KVM_API_VERSION,
            });
        }

        // The run-state buffer itself is mapped inside create_vcpu; the
        // size query survives as a session-level sanity check.
        let run_size = kvm.get_vcpu_mmap_size().map_err(VmError::RunStateSize)?;
        if run_size < size_of::<kvm_run>() {
            return Err(VmError::RunStateTooSmall {
                size: run_size,
                min: size_of::<kvm_run>(),
            });
        }
        debug!("vCPU run-state mapping size: {} bytes", run_size);

        let vm = kvm.create_vm().map_err(VmError::VmCreate)?;

        let mut memory = GuestRam::new(config.memory_size)?;
        memory.register(&vm, config.slot, config.guest_base)?;

        // The vCPU comes after registration so its first run sees the
        // region.
        let vcpu = vm.create_vcpu(0).map_err(VmError::VcpuCreate)?;
        cpu::init_vcpu_state(&vcpu, config.guest_base)?;

        info!(
            "VM ready: {} bytes of guest memory at {:#x}, entry {:#x}",
            config.memory_size, config.guest_base, config.guest_base,
        );

        Ok(Self {
            vcpu,
            memory,
            vm,
            kvm,
            config,
            state: VmState::Ready,
        })
    }

    /// Copy a guest program to the start of guest memory.
    pub fn load_payload(&self, program: &[u8]) -> Result<(), VmError> {
        self.memory.load(program)?;
        Ok(())
    }

    /// Run the guest until it halts or a fatal condition stops the loop.
    ///
    /// The blocking run call is the only suspension point; each return
    /// is classified and either resumed or made terminal. The state
    /// machine is observable through [`state`](Self::state) afterwards.
    pub fn run(&mut self) -> Result<HaltReport, VmError> {
        loop {
            self.state = VmState::Running;

            let exit = match self.vcpu.run() {
                Ok(exit) => exit,
                Err(e) => {
                    self.state = VmState::Failed;
                    return Err(VmError::VcpuRun(e));
                }
            };

            self.state = VmState::Suspended;
            let action = classify(exit);
            self.state = VmState::after(&action);

            match action {
                ExitAction::Resume => continue,
                ExitAction::Halt => {
                    let regs = match self.vcpu.get_regs() {
                        Ok(regs) => regs,
                        Err(e) => {
                            self.state = VmState::Failed;
                            return Err(CpuError::GetRegs(e).into());
                        }
                    };
                    let report = HaltReport {
                        rax: regs.rax,
                        rbx: regs.rbx,
                        rip: regs.rip,
                    };
                    info!(
                        "Guest halted: rax={:#x} rbx={:#x} rip={:#x}",
                        report.rax, report.rbx, report.rip,
                    );
                    return Ok(report);
                }
                ExitAction::Fatal(fatal) => return Err(fatal.into()),
            }
        }
    }

    /// Current dispatch state.
    #[inline]
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Construction parameters this VM was built with.
    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Handle to the underlying hypervisor session.
    #[inline]
    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// Handle to the underlying VM capability.
    #[inline]
    pub fn vm_fd(&self) -> &VmFd {
        &self.vm
    }

    /// The guest memory region.
    #[inline]
    pub fn memory(&self) -> &GuestRam {
        &self.memory
    }
}
