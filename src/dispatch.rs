//! Exit classification and the run-loop state machine.
//!
//! Every exit the hypervisor can report maps to exactly one action. An
//! unrecognized exit stops the loop: the shared run-state buffer is
//! overwritten in place on each suspension, so continuing past an
//! unknown reason could act on stale fields left over from a previous
//! exit.

use kvm_ioctls::VcpuExit;
use log::{debug, warn};
use std::fmt;

/// Lifecycle of the bootstrap VM around its single vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Constructed and programmed, not yet run.
    Ready,
    /// Inside the blocking run call.
    Running,
    /// Returned from a run with a decoded exit, action pending.
    Suspended,
    /// The guest executed `hlt`. Terminal, success.
    Halted,
    /// A fatal exit or an OS-level run failure. Terminal, failure.
    Failed,
}

impl VmState {
    /// State reached by applying `action` to a suspended vCPU.
    pub fn after(action: &ExitAction) -> VmState {
        match action {
            ExitAction::Resume => VmState::Running,
            ExitAction::Halt => VmState::Halted,
            ExitAction::Fatal(_) => VmState::Failed,
        }
    }

    /// Whether the loop stops in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Halted | VmState::Failed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Ready => "ready",
            VmState::Running => "running",
            VmState::Suspended => "suspended",
            VmState::Halted => "halted",
            VmState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the dispatcher does with a suspended vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Resume,
    /// Read final registers and stop. Terminal, success.
    Halt,
    /// Stop with failure semantics.
    Fatal(FatalExit),
}

/// Exit classes that stop the loop as failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalExit {
    /// The hypervisor could not enter the guest.
    FailedEntry {
        /// Hardware entry failure reason reported by the hypervisor.
        hw_reason: u64,
        /// vCPU the entry failed on.
        cpu: u32,
    },
    /// The hypervisor reported an internal error.
    InternalError,
    /// An exit reason outside the recognized table.
    Unrecognized(String),
}

/// Classify one decoded exit and perform its acknowledgment.
///
/// Port I/O is acknowledged but not emulated: output data is dropped and
/// input buffers read as 0xff, the floating-bus convention for an
/// unbacked port. Every exit not in the table is fatal.
pub fn classify(exit: VcpuExit<'_>) -> ExitAction {
    match exit {
        VcpuExit::Hlt => {
            debug!("Exit: hlt");
            ExitAction::Halt
        }
        VcpuExit::IoIn(port, data) => {
            debug!(
                "Exit: port input at {:#x} ({} bytes), no device backs it",
                port,
                data.len(),
            );
            data.fill(0xff);
            ExitAction::Resume
        }
        VcpuExit::IoOut(port, data) => {
            debug!(
                "Exit: port output at {:#x} ({} bytes), dropped",
                port,
                data.len(),
            );
            ExitAction::Resume
        }
        VcpuExit::FailEntry(hw_reason, cpu) => {
            warn!(
                "Exit: VM entry failed on cpu {} (hardware reason {:#x})",
                cpu, hw_reason,
            );
            ExitAction::Fatal(FatalExit::FailedEntry { hw_reason, cpu })
        }
        VcpuExit::InternalError => {
            warn!("Exit: internal error");
            ExitAction::Fatal(FatalExit::InternalError)
        }
        other => {
            warn!("Exit: unhandled reason {:?}", other);
            ExitAction::Fatal(FatalExit::Unrecognized(format!("{:?}", other)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_stops_the_loop() {
        assert_eq!(classify(VcpuExit::Hlt), ExitAction::Halt);
    }

    #[test]
    fn port_input_resumes_and_reads_floating_bus() {
        let mut data = [0u8; 2];
        let action = classify(VcpuExit::IoIn(0x3f8, &mut data));
        assert_eq!(action, ExitAction::Resume);
        assert_eq!(data, [0xff, 0xff]);
    }

    #[test]
    fn port_output_resumes_without_emulation() {
        let data = [0x2au8];
        assert_eq!(classify(VcpuExit::IoOut(0x3f8, &data)), ExitAction::Resume);
    }

    #[test]
    fn failed_entry_is_fatal_with_reason() {
        let action = classify(VcpuExit::FailEntry(0x8000_0021, 0));
        match action {
            ExitAction::Fatal(FatalExit::FailedEntry { hw_reason, cpu }) => {
                assert_eq!(hw_reason, 0x8000_0021);
                assert_eq!(cpu, 0);
            }
            other => panic!("expected FailedEntry, got {:?}", other),
        }
    }

    #[test]
    fn internal_error_is_fatal() {
        assert_eq!(
            classify(VcpuExit::InternalError),
            ExitAction::Fatal(FatalExit::InternalError),
        );
    }

    #[test]
    fn unrecognized_exit_is_fatal_not_ignored() {
        // Shutdown is a real exit the table deliberately does not
        // recognize; it must land in the fatal catch-all.
        let action = classify(VcpuExit::Shutdown);
        assert!(matches!(
            action,
            ExitAction::Fatal(FatalExit::Unrecognized(_)),
        ));
    }

    #[test]
    fn every_action_reaches_a_defined_state() {
        assert_eq!(VmState::after(&ExitAction::Resume), VmState::Running);
        assert_eq!(VmState::after(&ExitAction::Halt), VmState::Halted);
        assert_eq!(
            VmState::after(&ExitAction::Fatal(FatalExit::InternalError)),
            VmState::Failed,
        );
        assert_eq!(
            VmState::after(&ExitAction::Fatal(FatalExit::FailedEntry {
                hw_reason: 0,
                cpu: 0,
            })),
            VmState::Failed,
        );
        assert_eq!(
            VmState::after(&ExitAction::Fatal(FatalExit::Unrecognized(
                "Shutdown".into(),
            ))),
            VmState::Failed,
        );
    }

    #[test]
    fn only_halted_and_failed_are_terminal() {
        assert!(VmState::Halted.is_terminal());
        assert!(VmState::Failed.is_terminal());
        assert!(!VmState::Ready.is_terminal());
        assert!(!VmState::Running.is_terminal());
        assert!(!VmState::Suspended.is_terminal());
    }

    #[test]
    fn state_names_render_lowercase() {
        assert_eq!(VmState::Halted.to_string(), "halted");
        assert_eq!(VmState::Failed.to_string(), "failed");
    }
}
