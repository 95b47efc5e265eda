//! Internal macros

/// Unwraps using [`std::panic::panic_any`], so the error value itself
/// becomes the panic payload and can be recovered by the run loop.
/// See [https://github.com/rust-lang/rust/issues/78500]
#[macro_export]
macro_rules! unwrap_any {
    ($res:expr) => {
        $res.unwrap_or_else(|err| std::panic::panic_any(err))
    };
}

/// Record how long `$body` took in seconds on `$histogram`.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}
