use crate::prelude::*;

/// Battery voltage -> state-of-charge lookup.
///
/// Rows are (capacity percent, voltage) pairs ordered by capacity, with
/// voltages strictly increasing so interpolation is well defined. The
/// monotonicity check happens once at construction; a broken table is a
/// configuration error, never a runtime fallback.
#[derive(Debug, Clone)]
pub struct CapacityTable {
    rows: Vec<(f64, f64)>, // (percent, volts)
}

impl CapacityTable {
    pub fn new(rows: Vec<(f64, f64)>) -> Result<Self> {
        if rows.len() < 2 {
            bail!("capacity table needs at least two rows, got {}", rows.len());
        }

        for pair in rows.windows(2) {
            let (c1, v1) = pair[0];
            let (c2, v2) = pair[1];
            if c2 < c1 {
                bail!("capacity not monotonic: {}% after {}%", c2, c1);
            }
            if v2 <= v1 {
                bail!(
                    "voltage not strictly increasing: {}V after {}V (at {}%)",
                    v2,
                    v1,
                    c2
                );
            }
        }

        let (first, last) = (rows[0].0, rows[rows.len() - 1].0);
        if !(0.0..=100.0).contains(&first) || !(0.0..=100.0).contains(&last) {
            bail!("capacity percentages must lie within 0..=100");
        }

        Ok(Self { rows })
    }

    /// Interpolated capacity in percent. Below the lowest row -> 0, above
    /// the highest -> the top entry.
    pub fn capacity_percent(&self, volts: f64) -> f64 {
        if volts < self.rows[0].1 {
            return 0.0;
        }

        for pair in self.rows.windows(2) {
            let (c1, v1) = pair[0];
            let (c2, v2) = pair[1];
            if volts < v2 {
                return c1 + (c2 - c1) / (v2 - v1) * (volts - v1);
            }
        }

        self.rows[self.rows.len() - 1].0
    }
}
