use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::{Mutex, Once},
    time::Instant,
};

use thiserror::Error;

pub use rand;

pub mod config;
pub mod constraints;
pub mod loss;
pub mod optim;
pub mod prune;
pub mod schedule;
pub mod tensor;
pub mod train;

pub use config::TrainingConfig;
pub use optim::{Optimizer, OptimizerState};
pub use prune::PruningManager;
pub use schedule::LrScheduler;
pub use tensor::{ParameterSet, Tensor};
pub use train::{EpochMetrics, Model, Sample, Trainer};

/// Fatal errors abort the current epoch and propagate to the caller.
/// Non-finite numeric trouble is deliberately not here: it is surfaced as a
/// warning and training continues.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("shape mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },
    #[error("invalid state: {0}")]
    State(String),
}

static LOGGING: Once = Once::new();
static FILE_LOGGING: DynFileLogger = DynFileLogger {
    file: Mutex::new(None),
};

/// Log-file sink that can be re-pointed between runs while the fern
/// dispatcher stays installed. Writes are dropped until a file is set.
struct DynFileLogger {
    file: Mutex<Option<File>>,
}

impl Write for &'static DynFileLogger {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.lock().unwrap().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.lock().unwrap().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

pub fn init_logging() {
    LOGGING.call_once(|| {
        let start = Instant::now();
        let file: Box<dyn Write + Send + 'static> = Box::new(&FILE_LOGGING);

        fern::Dispatch::new()
            // Perform allocation-free log formatting
            .format(move |out, message, record| {
                let elapsed = start.elapsed().as_secs();
                let hours = elapsed / 3600;
                let mins = elapsed % 3600 / 60;
                let secs = elapsed % 3600 % 60;
                out.finish(format_args!(
                    "[{hours}:{mins}:{secs} {} {}] {}",
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(log::LevelFilter::Info)
            .chain(std::io::stderr())
            .chain(file)
            .apply()
            .expect("Logger should have initialized correctly");
    });
}

pub fn set_log_file(path: &Path) {
    *FILE_LOGGING.file.lock().unwrap() =
        Some(fern::log_file(path).expect("log file should be creatable"));
}
