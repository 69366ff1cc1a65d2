use super::result::ResultFlags;
use crate::exec::ProcessOutcome;
use crate::sandbox::ViolationKind;
use nix::sys::signal::Signal;

/// Limits a single case is judged against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaseLimits {
    /// CPU seconds
    pub time: f64,
    /// KB
    pub memory: u64,
}

/// Verdict bits derived from a finished process, before any checker runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub flags: ResultFlags,
    pub feedback: String,
}

/// Verdict classifier - pure function over a process outcome
pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(outcome: &ProcessOutcome, limits: &CaseLimits) -> Classification {
        let mut flags = ResultFlags::empty();
        let mut feedback = String::new();
        let signal = outcome.signal.and_then(|raw| Signal::try_from(raw).ok());

        if outcome.timed_out || signal == Some(Signal::SIGXCPU) || outcome.cpu_time > limits.time {
            flags |= ResultFlags::TLE;
        }
        if outcome.max_memory > limits.memory {
            flags |= ResultFlags::MLE;
        }
        if outcome.output_limit_exceeded.is_some() {
            flags |= ResultFlags::OLE;
        }

        match &outcome.violation {
            Some(violation) if violation.kind == ViolationKind::Disallowed => {
                flags |= ResultFlags::IR;
                feedback = format!("{} syscall disallowed", violation.label());
            }
            Some(violation) => {
                flags |= ResultFlags::RTE;
                feedback = violation
                    .detail
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", violation.label()));
            }
            None => {
                if let Some(rte) = Self::runtime_error(outcome, signal) {
                    flags |= ResultFlags::RTE;
                    feedback = rte;
                }
            }
        }

        Classification { flags, feedback }
    }

    /// A death the sandbox did not cause itself
    fn runtime_error(outcome: &ProcessOutcome, signal: Option<Signal>) -> Option<String> {
        match (outcome.exit_code, signal) {
            (Some(0), None) => None,
            (Some(code), None) => Some(format!("exit code {}", code)),
            (_, Some(Signal::SIGXCPU)) => None,
            // Our own kills for a timeout or an output overflow
            (_, Some(Signal::SIGKILL)) if outcome.timed_out || outcome.output_limit_exceeded.is_some() => None,
            (_, Some(signal)) => Some(signal.as_str().to_string()),
            (None, None) => Some("process vanished".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::OutputStream;
    use crate::exec::SyscallViolation;
    use crate::kernel::abi::Abi;

    fn limits() -> CaseLimits {
        CaseLimits {
            time: 2.0,
            memory: 65536,
        }
    }

    fn clean() -> ProcessOutcome {
        ProcessOutcome {
            exit_code: Some(0),
            cpu_time: 0.5,
            wall_time: 0.6,
            max_memory: 1024,
            ..ProcessOutcome::default()
        }
    }

    #[test]
    fn test_clean_exit_has_no_flags() {
        assert_eq!(VerdictClassifier::classify(&clean(), &limits()).flags, ResultFlags::empty());
    }

    #[test]
    fn test_watchdog_kill_is_tle_not_rte() {
        let outcome = ProcessOutcome {
            exit_code: None,
            signal: Some(libc::SIGKILL),
            timed_out: true,
            ..clean()
        };
        let result = VerdictClassifier::classify(&outcome, &limits());
        assert_eq!(result.flags, ResultFlags::TLE);
    }

    #[test]
    fn test_sigxcpu_is_tle() {
        let outcome = ProcessOutcome {
            exit_code: None,
            signal: Some(libc::SIGXCPU),
            cpu_time: 3.0,
            ..clean()
        };
        assert_eq!(VerdictClassifier::classify(&outcome, &limits()).flags, ResultFlags::TLE);
    }

    #[test]
    fn test_segfault_is_rte_with_signal_feedback() {
        let outcome = ProcessOutcome {
            exit_code: None,
            signal: Some(libc::SIGSEGV),
            ..clean()
        };
        let result = VerdictClassifier::classify(&outcome, &limits());
        assert_eq!(result.flags, ResultFlags::RTE);
        assert_eq!(result.feedback, "SIGSEGV");
    }

    #[test]
    fn test_nonzero_exit_is_rte() {
        let outcome = ProcessOutcome {
            exit_code: Some(3),
            ..clean()
        };
        assert_eq!(VerdictClassifier::classify(&outcome, &limits()).flags, ResultFlags::RTE);
    }

    #[test]
    fn test_disallowed_syscall_is_ir() {
        let outcome = ProcessOutcome {
            exit_code: None,
            signal: Some(libc::SIGKILL),
            violation: Some(SyscallViolation {
                abi: Abi::X64,
                number: 57,
                name: Some("fork".to_string()),
                kind: ViolationKind::Disallowed,
                detail: None,
            }),
            ..clean()
        };
        let result = VerdictClassifier::classify(&outcome, &limits());
        assert_eq!(result.flags, ResultFlags::IR);
        assert_eq!(result.feedback, "fork syscall disallowed");
    }

    #[test]
    fn test_fault_violation_is_rte() {
        let outcome = ProcessOutcome {
            exit_code: None,
            signal: Some(libc::SIGKILL),
            violation: Some(SyscallViolation {
                abi: Abi::X64,
                number: 2,
                name: Some("open".to_string()),
                kind: ViolationKind::Fault,
                detail: Some("unreadable path pointer".to_string()),
            }),
            ..clean()
        };
        let result = VerdictClassifier::classify(&outcome, &limits());
        assert_eq!(result.flags, ResultFlags::RTE);
        assert_eq!(result.feedback, "unreadable path pointer");
    }

    #[test]
    fn test_independent_bits_combine() {
        let outcome = ProcessOutcome {
            max_memory: 100_000,
            cpu_time: 2.5,
            output_limit_exceeded: Some((OutputStream::Stdout, 10)),
            ..clean()
        };
        let flags = VerdictClassifier::classify(&outcome, &limits()).flags;
        assert_eq!(flags, ResultFlags::TLE | ResultFlags::MLE | ResultFlags::OLE);
        assert_eq!(flags.main_code(), ResultFlags::TLE);
    }
}
