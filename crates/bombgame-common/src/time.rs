//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Countdown arithmetic shared by the bomb timer and display."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

/// Smallest sleep the countdown loop will schedule.
pub const MIN_TICK_SLEEP: Duration = Duration::from_millis(1);

/// Whole seconds shown on a countdown display for `time_left`.
///
/// The display rounds up, so 0.2 s left still reads `1` and only an exhausted
/// timer reads `0`.
pub fn displayed_seconds(time_left: f64) -> u64 {
    if time_left <= 0.0 {
        0
    } else {
        time_left.ceil() as u64
    }
}

/// Wall-clock time until the displayed second changes at the given speed.
pub fn until_next_second(time_left: f64, speed: f64) -> Duration {
    if time_left <= 0.0 || speed <= 0.0 {
        return MIN_TICK_SLEEP;
    }
    let shown = time_left.ceil();
    let mut remainder = time_left - (shown - 1.0);
    if remainder <= 0.0 {
        remainder = 1.0;
    }
    Duration::from_secs_f64(remainder / speed).max(MIN_TICK_SLEEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rounds_up() {
        assert_eq!(displayed_seconds(0.0), 0);
        assert_eq!(displayed_seconds(-1.0), 0);
        assert_eq!(displayed_seconds(0.2), 1);
        assert_eq!(displayed_seconds(299.999), 300);
        assert_eq!(displayed_seconds(300.0), 300);
    }

    #[test]
    fn next_second_scales_with_speed() {
        let at_normal = until_next_second(10.5, 1.0);
        assert!((at_normal.as_secs_f64() - 0.5).abs() < 1e-9);
        let at_double = until_next_second(10.5, 2.0);
        assert!((at_double.as_secs_f64() - 0.25).abs() < 1e-9);
        let on_boundary = until_next_second(10.0, 1.0);
        assert!((on_boundary.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn next_second_never_busy_loops() {
        assert_eq!(until_next_second(0.0, 1.0), MIN_TICK_SLEEP);
        assert_eq!(until_next_second(5.0, 0.0), MIN_TICK_SLEEP);
        assert!(until_next_second(1e-12, 1.0) >= MIN_TICK_SLEEP);
    }
}
