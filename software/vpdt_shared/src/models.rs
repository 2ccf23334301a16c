//! Static parameter table for known detector models.
//!
//! The register protocol identifies a device only by the model string it
//! reports during discovery; everything the host needs to size windows
//! and acquisition buffers comes from this table.

/// Fixed per-model hardware parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub struct DetectorParams {
    pub model: &'static str,
    /// Number of configurable energy windows
    pub window_count: u32,
    /// Total pixel count of the module
    pub pixel_count: usize,
    /// Highest representable threshold value
    pub max_threshold: u32,
    /// Pixels per streamed package in threshold mode
    pub package_pixels: usize,
}

/// All models the register protocol knows how to drive.
pub static MODELS: &[DetectorParams] = &[DetectorParams {
    model: "D80",
    window_count: 4,
    pixel_count: 80,
    max_threshold: 511,
    package_pixels: 20,
}];

/// Look up the parameter set for a reported model string.
pub fn model_params(model: &str) -> Option<&'static DetectorParams> {
    MODELS.iter().find(|p| p.model == model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn d80_parameters() {
        let p = model_params("D80").unwrap();
        assert_eq!(p.window_count, 4);
        assert_eq!(p.pixel_count, 80);
        assert_eq!(p.max_threshold, 511);
        assert_eq!(p.package_pixels, 20);
        assert!(model_params("D81").is_none());
    }
}
