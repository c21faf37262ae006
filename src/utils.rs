use core_affinity::CoreId;
use std::io;

/// Pin the calling thread to one of the cores it is allowed to run on
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    let allowed = core_affinity::get_core_ids().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Unsupported, "cannot list the available cores")
    })?;
    if !allowed.iter().any(|c| c.id == core) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {core} is not available ({} cores)", allowed.len()),
        ));
    }
    if core_affinity::set_for_current(CoreId { id: core }) {
        Ok(())
    } else {
        Err(io::Error::other(format!("cannot set the affinity to core {core}")))
    }
}

/// Pin the calling thread if asked to. A failure only degrades performance, so it is logged.
pub fn pin_if_requested(pin: bool, core: usize) {
    if !pin {
        return;
    }
    let name = std::thread::current().name().unwrap_or("worker").to_owned();
    match pin_current_thread(core) {
        Ok(()) => log::debug!("{name} pinned to core {core}"),
        Err(e) => log::warn!("Cannot pin {name} to core {core}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_core_is_an_error() {
        assert!(pin_current_thread(1 << 20).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pin_to_an_allowed_core() {
        // the test may run in a restricted cpuset, so pick a core it is allowed to use
        let core = core_affinity::get_core_ids().unwrap()[0].id;
        std::thread::spawn(move || pin_current_thread(core).unwrap())
            .join()
            .unwrap();
    }
}
