mod backend;
mod backends;
mod result;

pub use backend::{check_input, DetectorBackend};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{parse_array, parse_output, RawDetection, RECORD_LEN};
