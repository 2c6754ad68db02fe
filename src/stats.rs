use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Named wall-clock timers collected by the manager over one combination
/// iteration and persisted as JSON. I/O problems are logged and never
/// abort the run.
#[derive(Default)]
pub struct Stats {
    finished: BTreeMap<String, f64>,
    running: HashMap<String, Instant>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn start(&mut self, name: &str) {
        if self.running.insert(name.to_string(), Instant::now()).is_some() {
            log::warn!("timer '{}' restarted while running", name);
        }
    }

    pub fn stop(&mut self, name: &str) {
        match self.running.remove(name) {
            Some(started) => {
                let elapsed = started.elapsed().as_secs_f64();
                *self.finished.entry(name.to_string()).or_insert(0.0) += elapsed;
            }
            None => log::warn!("timer '{}' stopped but never started", name),
        }
    }

    pub fn durations(&self) -> &BTreeMap<String, f64> {
        &self.finished
    }

    /// Writes the timers of the finished iteration to
    /// `<dir>/iteration_<n>.json` and resets them. The file is written
    /// exactly once and not re-opened.
    pub fn write_iteration(&mut self, dir: &Path, iteration: usize) {
        let timers = std::mem::take(&mut self.finished);
        let document = json!({
            "iteration": iteration,
            "timers": timers,
        });
        let path = dir.join(format!("iteration_{}.json", iteration));
        let result = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, document.to_string()));
        if let Err(e) = result {
            log::error!("could not write statistics to {}: {}", path.display(), e);
        }
    }
}
