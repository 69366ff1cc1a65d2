//! Handlers for allow-listed calls that reach beyond the caller: signals,
//! resource limits and device control. A submission may aim them at its own
//! process group only.

use super::policy::{Decision, Handler, SyscallContext, Violation};

/// `ioctl` requests a runtime issues on its inherited descriptors
const IOCTL_REQUESTS: &[(u64, &str)] = &[
    (libc::TCGETS as u64, "TCGETS"),
    (libc::TIOCGWINSZ as u64, "TIOCGWINSZ"),
    (libc::TIOCGPGRP as u64, "TIOCGPGRP"),
    (libc::FIONREAD as u64, "FIONREAD"),
    (libc::FIONBIO as u64, "FIONBIO"),
    (libc::FIOCLEX as u64, "FIOCLEX"),
    (libc::FIONCLEX as u64, "FIONCLEX"),
];

/// Guarded handler for `name`, if it needs one
pub fn guard(name: &str) -> Option<Handler> {
    let check: fn(&SyscallContext<'_>) -> Result<(), Violation> = match name {
        "kill" => |ctx| signal_target(ctx, ctx.frame.arg_int(0)),
        "tgkill" | "tkill" => |ctx| signal_target(ctx, ctx.frame.arg_int(0)).and_then(|()| nonzero(ctx)),
        "prlimit64" => rlimit_update,
        "ioctl" => ioctl_request,
        _ => return None,
    };
    Some(Handler::callback(move |ctx| match check(ctx) {
        Ok(()) => Decision::Allow,
        Err(violation) => Decision::Deny(violation),
    }))
}

fn nonzero(ctx: &SyscallContext<'_>) -> Result<(), Violation> {
    match ctx.frame.arg_int(0) {
        0 => Err(Violation::disallowed(format!("{} of task 0", ctx.name))),
        _ => Ok(()),
    }
}

fn own_group(ctx: &SyscallContext<'_>) -> Result<i32, Violation> {
    ctx.memory
        .process_group(0)
        .map_err(|err| Violation::fault(format!("{}: cannot read own process group: {}", ctx.name, err)))
}

/// `kill` semantics: 0 is the caller's group, -1 is everyone, -N is group N
fn signal_target(ctx: &SyscallContext<'_>, target: i32) -> Result<(), Violation> {
    let group = own_group(ctx)?;
    let allowed = match target {
        0 => true,
        -1 => false,
        t if t < 0 => t.checked_neg() == Some(group),
        t => ctx.memory.process_group(t).map_or(false, |other| other == group),
    };
    if allowed {
        Ok(())
    } else {
        Err(Violation::disallowed(format!("{} of foreign target {}", ctx.name, target)))
    }
}

/// Own limits only, and never raised
fn rlimit_update(ctx: &SyscallContext<'_>) -> Result<(), Violation> {
    let pid = ctx.frame.arg_int(0);
    if pid != 0 && pid != ctx.memory.pid() {
        return Err(Violation::disallowed(format!("prlimit64 of foreign pid {}", pid)));
    }
    let new_limit = ctx.frame.arg(2);
    if new_limit == 0 {
        return Ok(());
    }
    let resource = ctx.frame.arg_int(1);
    let bytes = ctx
        .memory
        .read_bytes(new_limit, 16)
        .map_err(|err| Violation::fault(format!("prlimit64: unreadable rlimit: {}", err)))?;
    let (Some(soft), Some(hard)) = (word(&bytes, 0), word(&bytes, 8)) else {
        return Err(Violation::fault("prlimit64: short rlimit"));
    };
    let (current_soft, current_hard) = ctx
        .memory
        .resource_limit(resource)
        .map_err(|err| Violation::fault(format!("prlimit64: cannot read limit {}: {}", resource, err)))?;
    if soft > current_soft || hard > current_hard {
        return Err(Violation::disallowed(format!(
            "prlimit64 raises limit {} to {}/{}",
            resource, soft, hard
        )));
    }
    Ok(())
}

fn word(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(raw))
}

fn ioctl_request(ctx: &SyscallContext<'_>) -> Result<(), Violation> {
    let request = ctx.frame.arg(1) & 0xffff_ffff;
    if IOCTL_REQUESTS.iter().any(|&(allowed, _)| allowed == request) {
        Ok(())
    } else {
        Err(Violation::disallowed(format!("ioctl request {:#x}", request)))
    }
}
