use indicatif::ProgressStyle;
use tracing::{info_span, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

pub fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise} / {eta_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// A span that renders as a progress bar while it is entered. Advance it with `pb_inc`.
pub fn progress_span(len: u64, message: &str) -> Span {
    let span = info_span!("progress", len);
    span.pb_set_style(&progress_style());
    span.pb_set_length(len);
    span.pb_set_message(message);

    span
}
