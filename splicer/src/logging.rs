use std::path::Path;

pub fn setup_logging(log_dir: &Path, level: log::LevelFilter) -> Result<(), fern::InitError> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file = log_dir.join(format!("splicer_{}.log", timestamp));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file)?)
        .apply()?;

    log::info!("Logging initialized, writing to: {}", log_file.display());

    cleanup_old_logs(log_dir, 10);

    Ok(())
}

/// Keeps the `keep` most recently modified `.log` files in `log_dir`
fn cleanup_old_logs(log_dir: &Path, keep: usize) {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to read log directory: {}", e);
            return;
        }
    };

    let mut logs: Vec<_> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if path.extension()? != "log" {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, path))
        })
        .collect();
    if logs.len() <= keep {
        return;
    }

    logs.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));
    for (_, path) in logs.drain(keep..) {
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed old log file: {}", path.display()),
            Err(e) => log::warn!("Failed to remove old log file {}: {}", path.display(), e),
        }
    }
}
