use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Live progress of one placement run. The pipeline's write stage feeds it
/// chunk and sequence counts; the query stream length is unknown up front, so
/// this is a steady-tick spinner rather than a bar.
#[derive(Clone)]
pub struct PlacementProgress {
    pb: Option<ProgressBar>,
}

impl PlacementProgress {
    pub fn new(enabled: bool) -> Self {
        let pb = enabled.then(|| {
            let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
            pb.set_style(
                ProgressStyle::with_template(
                    "{prefix:.bold} {spinner:.green} {msg} [{elapsed_precise}]",
                )
                .unwrap()
                .tick_chars("▁▂▃▄▅▆▇█▇▆▅▄▃▂"),
            );
            pb.set_prefix("EPA");
            pb.set_message("placing");
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        });
        Self { pb }
    }

    /// Reports one completed pipeline cycle.
    pub fn chunk_done(&self, chunk_num: usize, sequences_done: usize) {
        if let Some(pb) = &self.pb {
            pb.set_message(format!(
                "chunk {chunk_num}: {sequences_done} sequences placed"
            ));
        }
    }

    pub fn finish(&self, sequences_done: usize) {
        if let Some(pb) = &self.pb {
            pb.finish_with_message(format!("{sequences_done} sequences placed"));
        }
    }
}

/// Spinner for a one-shot IO step such as loading the reference alignment.
pub fn io_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner:.cyan} {msg} [{elapsed}]")
            .unwrap()
            .tick_chars("◐◓◑◒"),
    );
    pb.set_prefix("IO");
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
