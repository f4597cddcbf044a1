//! Integrated detector values and their first/second moment statistics.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Centre and width of a detector's distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    pub x0: f64,
    pub dx: f64,
    pub y0: f64,
    pub dy: f64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            x0: 0.0,
            dx: 1.0,
            y0: 0.0,
            dy: 1.0,
        }
    }
}

impl Statistics {
    /// Parse `X0=..; dX=..; Y0=..; dY=..`. Missing entries take their
    /// defaults; a zero `dX` becomes 1, and then a zero `dY` takes `dX`.
    pub fn parse(stats: &str) -> Result<Self> {
        let entries: HashMap<&str, &str> = stats
            .split(';')
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let defaults = Statistics::default();
        let field = |key: &str, default: f64| -> Result<f64> {
            match entries.get(key) {
                Some(v) => v.parse::<f64>().map_err(|_| {
                    Error::ReportFormat(format!("statistic {key} is not a number: `{v}`"))
                }),
                None => Ok(default),
            }
        };

        let x0 = field("X0", defaults.x0)?;
        let mut dx = field("dX", defaults.dx)?;
        let y0 = field("Y0", defaults.y0)?;
        let mut dy = field("dY", defaults.dy)?;

        if dx == 0.0 {
            dx = 1.0;
        }
        if dy == 0.0 {
            dy = if dx != 0.0 { dx } else { 1.0 };
        }
        Ok(Self { x0, dx, y0, dy })
    }
}

/// One monitor's integrated result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detector {
    pub name: String,
    pub intensity: f64,
    pub error: f64,
    pub count: f64,
    pub path: String,
    #[serde(flatten)]
    pub stats: Statistics,
}

impl Detector {
    pub fn new(
        name: &str,
        intensity: f64,
        error: f64,
        count: f64,
        path: &str,
        statistics: &str,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            intensity,
            error,
            count,
            path: path.to_string(),
            stats: Statistics::parse(statistics)?,
        })
    }

    /// Build from a `values: I E N` line as found in simulation output.
    pub fn from_values(name: &str, values: &str, path: &str, statistics: &str) -> Result<Self> {
        let nums = values
            .split_whitespace()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| Error::ReportFormat(format!("detector value `{v}` is not a number")))
            })
            .collect::<Result<Vec<f64>>>()?;
        let [intensity, error, count] = nums[..] else {
            return Err(Error::ReportFormat(format!(
                "detector {name}: expected 3 values, got {}",
                nums.len()
            )));
        };
        Self::new(name, intensity, error, count, path, statistics)
    }

    pub fn values(&self) -> [f64; 3] {
        [self.intensity, self.error, self.count]
    }
}
