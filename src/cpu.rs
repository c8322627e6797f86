//! Initial vCPU architectural state for the bootstrap guest.
//!
//! The guest starts in real mode. Real-mode address translation is
//! `segment base + offset`, and KVM initialises the code segment at the
//! reset vector (base 0xffff0000, selector 0xf000), so a program loaded
//! at guest physical 0x0 with a zero instruction pointer would fetch from
//! the wrong linear address. Forcing the code-segment base and selector
//! to zero makes linear address equal the offset into the loaded region.
//! That is a precondition of this flat, zero-based layout for a small
//! fixed guest, not a general program-loading mechanism.

use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuFd;
use log::info;
use thiserror::Error;

/// RFLAGS bit 1 is reserved and must read as set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// Errors from reading or writing vCPU register state.
#[derive(Error, Debug)]
pub enum CpuError {
    /// Reading the general-purpose register set failed.
    #[error("Failed to get vCPU registers: {0}")]
    GetRegs(#[source] kvm_ioctls::Error),

    /// Writing the general-purpose register set failed.
    #[error("Failed to set vCPU registers: {0}")]
    SetRegs(#[source] kvm_ioctls::Error),

    /// Reading the segment and control register set failed.
    #[error("Failed to get vCPU segment registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    /// Writing the segment and control register set failed.
    #[error("Failed to set vCPU segment registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),
}

/// General-purpose register state for entry at `entry`.
///
/// Instruction pointer at `entry`, the RFLAGS reserved bit set, and the
/// accumulator and base registers cleared so the guest program starts
/// from a known state. Everything else stays zero.
pub fn boot_regs(entry: u64) -> kvm_regs {
    kvm_regs {
        rip: entry,
        rflags: RFLAGS_RESERVED,
        rax: 0,
        rbx: 0,
        ..Default::default()
    }
}

/// Zero the code-segment base and selector in `sregs`.
///
/// Leaves every other segment and control register as the hypervisor
/// initialised it.
pub fn set_flat_code_segment(sregs: &mut kvm_sregs) {
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
}

/// Program the initial architectural state on a freshly created vCPU.
///
/// Applied once, before the first run; the hypervisor only picks up
/// register writes between run invocations.
pub fn init_vcpu_state(vcpu: &VcpuFd, entry: u64) -> Result<(), CpuError> {
    let mut sregs = vcpu.get_sregs().map_err(CpuError::GetSregs)?;
    set_flat_code_segment(&mut sregs);
    vcpu.set_sregs(&sregs).map_err(CpuError::SetSregs)?;

    vcpu.set_regs(&boot_regs(entry)).map_err(CpuError::SetRegs)?;

    info!(
        "vCPU 0 programmed: rip={:#x}, rflags={:#x}, flat code segment",
        entry, RFLAGS_RESERVED,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_regs_sets_entry_and_reserved_flag() {
        let regs = boot_regs(0x0);
        assert_eq!(regs.rip, 0);
        assert_eq!(regs.rflags, RFLAGS_RESERVED);
    }

    #[test]
    fn boot_regs_clears_accumulator_and_base() {
        let regs = boot_regs(0x1000);
        assert_eq!(regs.rip, 0x1000);
        assert_eq!(regs.rax, 0);
        assert_eq!(regs.rbx, 0);
    }

    #[test]
    fn boot_regs_leaves_other_registers_zero() {
        let regs = boot_regs(0);
        assert_eq!(regs.rsp, 0);
        assert_eq!(regs.rcx, 0);
        assert_eq!(regs.rdx, 0);
        assert_eq!(regs.rsi, 0);
        assert_eq!(regs.rdi, 0);
    }

    #[test]
    fn flat_code_segment_zeroes_base_and_selector() {
        let mut sregs = kvm_sregs::default();
        // Reset-vector values as KVM reports them on a fresh vCPU.
        sregs.cs.base = 0xffff_0000;
        sregs.cs.selector = 0xf000;
        sregs.cs.limit = 0xffff;

        set_flat_code_segment(&mut sregs);

        assert_eq!(sregs.cs.base, 0);
        assert_eq!(sregs.cs.selector, 0);
        assert_eq!(sregs.cs.limit, 0xffff, "limit must not be touched");
    }

    #[test]
    fn flat_code_segment_leaves_other_segments_alone() {
        let mut sregs = kvm_sregs::default();
        sregs.ds.base = 0x1234;
        sregs.ss.selector = 0x10;
        sregs.cr0 = 0x60000010;

        set_flat_code_segment(&mut sregs);

        assert_eq!(sregs.ds.base, 0x1234);
        assert_eq!(sregs.ss.selector, 0x10);
        assert_eq!(sregs.cr0, 0x60000010);
    }
}
