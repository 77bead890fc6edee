//! Processor topology queries used to size the worker pool.

use std::num::NonZeroUsize;
use std::thread;

/// Returns the number of physical cores, ignoring hyperthreaded siblings.
///
/// Falls back to the number of logical processors when the topology cannot
/// be read, and to one if even that is unavailable.
#[must_use]
pub fn physical_core_count() -> usize {
    physical_cores()
        .or_else(|| thread::available_parallelism().ok().map(NonZeroUsize::get))
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn physical_cores() -> Option<usize> {
    use std::collections::BTreeSet;
    use std::fs;

    let mut cores = BTreeSet::new();
    for entry in fs::read_dir("/sys/devices/system/cpu").ok()? {
        let entry = entry.ok()?;
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(|name| name.strip_prefix("cpu")) else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        let topology = entry.path().join("topology");
        let read_id = |file: &str| -> Option<i64> {
            fs::read_to_string(topology.join(file))
                .ok()?
                .trim()
                .parse()
                .ok()
        };
        // Offline processors have no topology directory.
        let (Some(package), Some(core)) = (read_id("physical_package_id"), read_id("core_id"))
        else {
            continue;
        };
        cores.insert((package, core));
    }

    (!cores.is_empty()).then_some(cores.len())
}

#[cfg(not(target_os = "linux"))]
fn physical_cores() -> Option<usize> {
    None
}
