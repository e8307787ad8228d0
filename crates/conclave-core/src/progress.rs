/// Phase bands of the overall 0-100 progress scale.
const PHASE_RANGES: &[(&str, u8, u8)] = &[
    ("evaluation", 0, 10),
    ("inquiry", 10, 20),
    ("planning", 20, 40),
    ("collaboration", 40, 70),
    ("integration", 70, 90),
    ("finalization", 90, 100),
];

/// Maps (phase, in-phase fraction) to the overall progress percentage.
/// Unknown phases report 0; monotonicity per task is the caller's job via
/// `last_progress`.
pub fn phase_progress(phase: &str, fraction: f64) -> u8 {
    let Some(&(_, start, end)) = PHASE_RANGES.iter().find(|(name, _, _)| *name == phase) else {
        return 0;
    };
    let fraction = fraction.clamp(0.0, 1.0);
    (start as f64 + (end - start) as f64 * fraction).round() as u8
}
