use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::IdentifierBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    Bar,
    #[default]
    Text,
    Hidden,
}

/// Per-run progress display shared by every worker.
#[derive(Clone)]
pub enum Progress {
    Bar(ProgressBar),
    Text,
    Hidden,
}

impl Progress {
    pub fn start(mode: ProgressMode, total: usize) -> Self {
        match mode {
            ProgressMode::Bar => {
                let pb = ProgressBar::new(total as u64);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                Progress::Bar(pb)
            }
            ProgressMode::Text => {
                println!("start...");
                Progress::Text
            }
            ProgressMode::Hidden => Progress::Hidden,
        }
    }

    pub fn on_batch_complete(&self) {
        if let Progress::Bar(pb) = self {
            pb.inc(1);
        }
    }

    /// Close the display. Text mode prints every empty range on one line.
    pub fn on_finish(&self, empty: &[IdentifierBatch]) {
        match self {
            Progress::Bar(pb) => pb.finish(),
            Progress::Text => {
                if let Some(line) = empty_ranges_line(empty) {
                    println!("{line}");
                }
                println!("finish!");
            }
            Progress::Hidden => {}
        }
    }
}

/// `Nothing: 1..100, 101..200`, or `None` when every batch found something.
pub fn empty_ranges_line(empty: &[IdentifierBatch]) -> Option<String> {
    if empty.is_empty() {
        return None;
    }
    let mut sorted: Vec<_> = empty.iter().collect();
    sorted.sort_by_key(|b| b.first());
    let ranges: Vec<String> = sorted.iter().map(|b| b.to_string()).collect();
    Some(format!("Nothing: {}", ranges.join(", ")))
}
