use std::sync::Once;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rounds a buy price down to the tick grid.
pub fn quantize_price_floor(price: f64, tick_size: f64) -> Option<f64> {
    quantize(price, tick_size, f64::floor)
}

/// Rounds a sell price up to the tick grid so it never lands closer to the book.
pub fn quantize_price_ceil(price: f64, tick_size: f64) -> Option<f64> {
    quantize(price, tick_size, f64::ceil)
}

fn quantize(value: f64, step: f64, round: fn(f64) -> f64) -> Option<f64> {
    if !value.is_finite() || !step.is_finite() || value < 0.0 || step <= 0.0 {
        return None;
    }

    let scale = infer_decimal_scale(step);
    let factor = 10f64.powi(scale as i32);

    let value_units = (value * factor * 1e4).round() / 1e4;
    let step_units = (step * factor + 1e-9).round();
    if value_units < 0.0 || step_units <= 0.0 {
        return None;
    }

    let quantized_units = round(value_units / step_units) * step_units;
    if !quantized_units.is_finite() {
        return None;
    }

    let quantized = quantized_units / factor;
    if !quantized.is_finite() {
        return None;
    }

    // Re-snap to inferred decimal scale to avoid fp tails.
    Some((quantized * factor).round() / factor)
}

fn infer_decimal_scale(step: f64) -> usize {
    let formatted = format!("{step:.16}");
    match formatted.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len(),
        None => 0,
    }
}

pub fn decimal_string(value: f64) -> String {
    let mut out = format!("{value:.8}");
    while out.contains('.') && out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

pub fn exponential_backoff_duration(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let cap_ms = cap.as_millis().max(1) as u64;
    let shift = attempt.saturating_sub(1).min(16);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let sleep_ms = base_ms.saturating_mul(multiplier).min(cap_ms).max(1);
    Duration::from_millis(sleep_ms)
}

pub fn append_hex_lower(bytes: &[u8], out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
}

pub fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
            .is_err()
        {
            tracing::warn!("could not install rustls ring provider (already installed)");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{
        decimal_string, exponential_backoff_duration, quantize_price_ceil, quantize_price_floor,
    };
    use std::time::Duration;

    fn approx_eq(left: f64, right: f64) {
        let diff = (left - right).abs();
        assert!(diff < 1e-12, "left={} right={} diff={}", left, right, diff);
    }

    #[test]
    fn quantizes_price_floor() {
        let got = quantize_price_floor(123.4567, 0.01).expect("should quantize");
        approx_eq(got, 123.45);
    }

    #[test]
    fn quantizes_price_ceil() {
        let got = quantize_price_ceil(0.52341, 0.0001).expect("should quantize");
        approx_eq(got, 0.5235);
    }

    #[test]
    fn ceil_keeps_on_grid_price() {
        let got = quantize_price_ceil(0.5235, 0.0001).expect("should quantize");
        approx_eq(got, 0.5235);
    }

    #[test]
    fn floor_survives_float_edge() {
        let got = quantize_price_floor(0.3, 0.1).expect("should quantize");
        approx_eq(got, 0.3);
    }

    #[test]
    fn formats_decimals_without_trailing_zeros() {
        assert_eq!(decimal_string(0.52350000), "0.5235");
        assert_eq!(decimal_string(12.0), "12");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(30);

        assert_eq!(
            exponential_backoff_duration(base, 1, cap),
            Duration::from_millis(250)
        );
        assert_eq!(
            exponential_backoff_duration(base, 3, cap),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            exponential_backoff_duration(base, 50, cap),
            Duration::from_secs(30)
        );
    }
}
