pub mod certificate;
#[cfg(feature = "cli")]
pub mod cli;
pub mod engine;
pub mod error;
pub mod input;
pub mod model;
pub mod net;
pub mod output;
pub mod probe;
pub mod starttls;
pub mod tls;
pub mod util;

pub use engine::Scanner;
pub use error::ScanError;
pub use model::{ScanConfig, ScanReport, Target};
pub use probe::{Probe, ProbeRegistry};
