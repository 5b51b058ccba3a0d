///! Frequency to band lookup

use dxcluster_common::Band;

/// Inclusive kHz ranges, ordered by frequency
const BAND_TABLE: &[(f64, f64, Band)] = &[
    (135.7, 137.8, Band::M2200),
    (472.0, 479.0, Band::M630),
    (1_800.0, 2_000.0, Band::M160),
    (3_500.0, 4_000.0, Band::M80),
    (5_060.0, 5_450.0, Band::M60),
    (7_000.0, 7_300.0, Band::M40),
    (10_100.0, 10_150.0, Band::M30),
    (14_000.0, 14_350.0, Band::M20),
    (18_068.0, 18_168.0, Band::M17),
    (21_000.0, 21_450.0, Band::M15),
    (24_890.0, 24_990.0, Band::M12),
    (28_000.0, 29_700.0, Band::M10),
    (50_000.0, 54_000.0, Band::M6),
    (70_000.0, 70_500.0, Band::M4),
    (144_000.0, 148_000.0, Band::M2),
    (420_000.0, 450_000.0, Band::Cm70),
    (1_240_000.0, 1_300_000.0, Band::Cm23),
    // QO-100 narrowband downlink lives here
    (10_000_000.0, 10_500_000.0, Band::Cm3),
];

/// Band for a frequency in kHz, [`Band::Unknown`] outside every allocation.
pub fn band_for_khz(khz: f64) -> Band {
    BAND_TABLE
        .iter()
        .find(|(low, high, _)| khz >= *low && khz <= *high)
        .map(|(_, _, band)| *band)
        .unwrap_or(Band::Unknown)
}
