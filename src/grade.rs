use crate::config::GradeBand;

/// Static lookup from rating to curriculum grade label.
///
/// Bands are half-open `[min, max)` and contiguous; ratings outside the table
/// clamp to the first or last grade. The table is validated by `EngineConfig`.
#[derive(Debug, Clone)]
pub struct GradeMapper {
    bands: Vec<GradeBand>,
}

impl GradeMapper {
    pub fn new(bands: Vec<GradeBand>) -> Self {
        Self { bands }
    }

    pub fn grade_for(&self, rating: f64) -> &str {
        let (first, last) = match (self.bands.first(), self.bands.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return "",
        };

        if rating.is_nan() || rating < first.min {
            return &first.label;
        }
        if rating >= last.max {
            return &last.label;
        }

        // Bands are sorted and contiguous, so the first band whose upper bound
        // exceeds the rating contains it.
        let idx = self.bands.partition_point(|band| band.max <= rating);
        self.bands
            .get(idx)
            .map(|band| band.label.as_str())
            .unwrap_or(&last.label)
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_grade_table;

    fn mapper() -> GradeMapper {
        GradeMapper::new(default_grade_table())
    }

    #[test]
    fn same_band_maps_to_same_grade() {
        let m = mapper();
        assert_eq!(m.grade_for(1000.0), m.grade_for(1049.0));
        assert_eq!(m.grade_for(1000.0), "Grade 1");
    }

    #[test]
    fn boundary_flips_band() {
        let m = mapper();
        assert_ne!(m.grade_for(1050.0), m.grade_for(1049.0));
        assert_eq!(m.grade_for(1050.0), "Grade 2");
        assert_eq!(m.grade_for(1049.999), "Grade 1");
    }

    #[test]
    fn below_table_clamps_to_lowest() {
        assert_eq!(mapper().grade_for(120.0), "Grade 1");
    }

    #[test]
    fn above_table_clamps_to_highest() {
        let m = mapper();
        assert_eq!(m.grade_for(1550.0), "Grade 6");
        assert_eq!(m.grade_for(2400.0), "Grade 6");
    }

    #[test]
    fn every_interior_band_is_reachable() {
        let m = mapper();
        let labels: Vec<&str> = [950.0, 1100.0, 1200.0, 1300.0, 1400.0, 1500.0]
            .iter()
            .map(|r| m.grade_for(*r))
            .collect();
        assert_eq!(
            labels,
            vec!["Grade 1", "Grade 2", "Grade 3", "Grade 4", "Grade 5", "Grade 6"]
        );
    }

    #[test]
    fn nan_clamps_to_lowest() {
        assert_eq!(mapper().grade_for(f64::NAN), "Grade 1");
    }

    #[test]
    fn custom_table_is_used() {
        let m = GradeMapper::new(vec![
            GradeBand {
                label: "Foundation".to_string(),
                min: 0.0,
                max: 1200.0,
            },
            GradeBand {
                label: "Diploma".to_string(),
                min: 1200.0,
                max: 3000.0,
            },
        ]);
        assert_eq!(m.grade_for(1199.0), "Foundation");
        assert_eq!(m.grade_for(1200.0), "Diploma");
    }
}
