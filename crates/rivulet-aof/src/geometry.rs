//! File sizing policy: initial size, upper bound, and growth step.

use crate::error::AofError;

/// Page size used for alignment of all geometry values.
pub const PAGE: u64 = 4096;

/// Default maximum mapping size.
pub const DEFAULT_SIZE_UPPER: u64 = 16 * 1024 * 1024;

/// Default growth granularity.
pub const DEFAULT_GROWTH_STEP: u64 = 1024 * 1024;

/// Rounds `n` up to the next multiple of the page size.
#[must_use]
pub fn page_align(n: u64) -> u64 {
    n.div_ceil(PAGE) * PAGE
}

/// Sizing policy for an append-only file.
///
/// All three values are page-aligned upward on validation. The mapping
/// is reserved at `size_upper` once at open, so physical growth never
/// moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Initial physical file size.
    pub size_now: u64,
    /// Maximum mapping (and file) size.
    pub size_upper: u64,
    /// Granularity of file growth.
    pub growth_step: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            size_now: PAGE,
            size_upper: DEFAULT_SIZE_UPPER,
            growth_step: DEFAULT_GROWTH_STEP,
        }
    }
}

impl Geometry {
    /// Page-aligns every field and checks the invariants.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::InvalidGeometry`] when `growth_step` is zero
    /// or `size_now` exceeds `size_upper` after alignment.
    pub fn validated(self) -> Result<Self, AofError> {
        if self.growth_step == 0 {
            return Err(AofError::InvalidGeometry("growth_step must be > 0".into()));
        }
        let aligned = Self {
            size_now: page_align(self.size_now.max(1)),
            size_upper: page_align(self.size_upper),
            growth_step: page_align(self.growth_step),
        };
        if aligned.size_now > aligned.size_upper {
            return Err(AofError::InvalidGeometry(format!(
                "size_now {} exceeds size_upper {}",
                aligned.size_now, aligned.size_upper
            )));
        }
        Ok(aligned)
    }

    /// The next physical file size after `current`, large enough to
    /// hold `needed` bytes. Capped at `size_upper`.
    #[must_use]
    pub fn next_file_size(&self, current: u64, needed: u64) -> u64 {
        let mut n = current;
        while n < needed && n < self.size_upper {
            n = (n + (n % self.growth_step) + self.growth_step).min(self.size_upper);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_is_valid() {
        let g = Geometry::default().validated().unwrap();
        assert_eq!(g.size_now, PAGE);
        assert_eq!(g.size_upper, DEFAULT_SIZE_UPPER);
        assert_eq!(g.growth_step, DEFAULT_GROWTH_STEP);
    }

    #[test]
    fn fields_are_page_aligned_upward() {
        let g = Geometry {
            size_now: 1,
            size_upper: PAGE * 3 + 1,
            growth_step: 100,
        }
        .validated()
        .unwrap();
        assert_eq!(g.size_now, PAGE);
        assert_eq!(g.size_upper, PAGE * 4);
        assert_eq!(g.growth_step, PAGE);
    }

    #[test]
    fn zero_growth_step_is_rejected() {
        let err = Geometry {
            growth_step: 0,
            ..Geometry::default()
        }
        .validated()
        .unwrap_err();
        assert!(matches!(err, AofError::InvalidGeometry(_)));
    }

    #[test]
    fn size_now_above_upper_is_rejected() {
        let err = Geometry {
            size_now: PAGE * 8,
            size_upper: PAGE * 4,
            ..Geometry::default()
        }
        .validated()
        .unwrap_err();
        assert!(matches!(err, AofError::InvalidGeometry(_)));
    }

    #[test]
    fn growth_reaches_the_needed_size() {
        let g = Geometry::default().validated().unwrap();
        let next = g.next_file_size(PAGE, PAGE + 1);
        assert!(next > PAGE);
        assert!(next <= g.size_upper);
        // Requests past the cap saturate at size_upper.
        assert_eq!(g.next_file_size(g.size_upper, g.size_upper + 1), g.size_upper);
    }
}
