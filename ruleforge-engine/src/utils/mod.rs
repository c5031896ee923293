pub mod preview;
pub mod time_span;

pub use preview::{compress_field_set, preview_compact};
pub use time_span::{convert_relative_delta, convert_time_span, parse_lookback};
