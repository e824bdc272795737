pub mod executor;
pub mod parser;
pub mod score;

pub use executor::{ProbeExecutor, ProbeSpec};
pub use parser::{parse_diagnostics, sanitize_codec, ParsedDiagnostics};
pub use score::{score_streams, ScoredStream, StreamQuality};
