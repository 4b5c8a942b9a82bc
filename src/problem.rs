//! Caller-facing description of a single integration problem.
//!
//! Initial values and parameters can be given positionally or keyed by name. Both forms
//! are resolved once, at the model boundary, into the canonical ordered representation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::SystemError;

/// Numbers supplied either by position or by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Values {
    ByIndex(Vec<f64>),
    ByName(HashMap<String, f64>),
}

impl Default for Values {
    fn default() -> Self {
        Values::ByIndex(Vec::new())
    }
}

impl Values {
    /// Builds a by-name mapping from `(name, value)` pairs.
    pub fn by_name<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Values::ByName(
            pairs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    /// Resolves into `expected` ordered values.
    ///
    /// Names absent from a [`Values::ByName`] mapping default to `0.0`. A name that is not
    /// declared is a [`SystemError::ConfigurationError`], as is by-name input when the
    /// model declares no names.
    pub fn resolve(
        &self,
        names: Option<&[String]>,
        expected: usize,
        what: &'static str,
    ) -> Result<Vec<f64>, SystemError> {
        match self {
            Values::ByIndex(values) => {
                if values.len() != expected {
                    return Err(SystemError::dimension(what, expected, values.len()));
                }
                Ok(values.clone())
            }
            Values::ByName(map) => {
                let names = names.ok_or_else(|| {
                    SystemError::config(format!("{what} given by name, but no names are declared"))
                })?;
                if let Some(unknown) = map.keys().find(|k| !names.contains(k)) {
                    return Err(SystemError::config(format!(
                        "unknown name {unknown:?} in {what}"
                    )));
                }
                Ok(names
                    .iter()
                    .map(|name| map.get(name).copied().unwrap_or(0.0))
                    .collect())
            }
        }
    }
}

impl From<Vec<f64>> for Values {
    fn from(values: Vec<f64>) -> Self {
        Values::ByIndex(values)
    }
}

impl From<&[f64]> for Values {
    fn from(values: &[f64]) -> Self {
        Values::ByIndex(values.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Values {
    fn from(values: [f64; N]) -> Self {
        Values::ByIndex(values.to_vec())
    }
}

impl From<HashMap<String, f64>> for Values {
    fn from(map: HashMap<String, f64>) -> Self {
        Values::ByName(map)
    }
}

/// Requested output of the independent variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tout {
    /// Integrate over `[0, end]`, reporting every accepted step.
    End(f64),
    /// Integrate over `[start, end]`, reporting every accepted step.
    Span(f64, f64),
    /// Report exactly these points, integrating piecewise between them.
    Points(Vec<f64>),
}

impl Tout {
    /// The boundary points of the request, in the order they are integrated.
    pub fn points(&self) -> Result<Vec<f64>, SystemError> {
        let points = match self {
            Tout::End(end) => vec![0.0, *end],
            Tout::Span(start, end) => vec![*start, *end],
            Tout::Points(points) => points.clone(),
        };
        if points.len() < 2 {
            return Err(SystemError::config(
                "output points need at least a start and an end",
            ));
        }
        if points.iter().any(|x| !x.is_finite()) {
            return Err(SystemError::config("output points must be finite"));
        }
        let increasing = points.windows(2).all(|w| w[1] > w[0]);
        let decreasing = points.windows(2).all(|w| w[1] < w[0]);
        if !(increasing || decreasing) {
            return Err(SystemError::config(
                "output points must be strictly monotonic",
            ));
        }
        Ok(points)
    }

    /// Whether output is reported at every accepted step.
    pub fn is_adaptive(&self) -> bool {
        !matches!(self, Tout::Points(_))
    }
}

/// One problem instance: output request, initial values and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub tout: Tout,
    pub y0: Values,
    #[serde(default)]
    pub params: Values,
}

impl Problem {
    pub fn new(tout: Tout, y0: impl Into<Values>, params: impl Into<Values>) -> Self {
        Self {
            tout,
            y0: y0.into(),
            params: params.into(),
        }
    }

    /// Same request, continued from `x` with the state `y` (caller coordinates).
    ///
    /// Points already behind `x` are dropped; `x` itself becomes the first point.
    pub(crate) fn continued_from(&self, x: f64, y: Vec<f64>, params: Vec<f64>) -> Self {
        let tout = match &self.tout {
            Tout::End(end) | Tout::Span(_, end) => Tout::Span(x, *end),
            Tout::Points(points) => {
                let forward = points.last().zip(points.first()).map_or(true, |(l, f)| l >= f);
                let ahead = points
                    .iter()
                    .copied()
                    .filter(|p| if forward { *p > x } else { *p < x });
                Tout::Points(std::iter::once(x).chain(ahead).collect())
            }
        };
        Self {
            tout,
            y0: Values::ByIndex(y),
            params: Values::ByIndex(params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn test_resolve_by_name_defaults_missing_to_zero() -> Result<(), Box<dyn std::error::Error>> {
        let values = Values::by_name([("c", 3.0), ("a", 1.0)]);
        assert_eq!(values.resolve(Some(&names()), 3, "y0")?, vec![1.0, 0.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_resolve_errors() {
        let unknown = Values::by_name([("d", 1.0)]);
        assert!(matches!(
            unknown.resolve(Some(&names()), 3, "y0"),
            Err(SystemError::ConfigurationError(_))
        ));
        assert!(matches!(
            Values::by_name([("a", 1.0)]).resolve(None, 3, "y0"),
            Err(SystemError::ConfigurationError(_))
        ));
        assert!(matches!(
            Values::from([1.0, 2.0]).resolve(None, 3, "y0"),
            Err(SystemError::DimensionMismatch { expected: 3, got: 2, .. })
        ));
    }

    #[test]
    fn test_tout_points() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(Tout::End(2.0).points()?, vec![0.0, 2.0]);
        assert_eq!(Tout::Span(1.0, -1.0).points()?, vec![1.0, -1.0]);
        assert!(Tout::Points(vec![0.0, 2.0, 1.0]).points().is_err());
        assert!(Tout::Points(vec![0.0]).points().is_err());
        Ok(())
    }

    #[test]
    fn test_continued_from_drops_passed_points() {
        let problem = Problem::new(Tout::Points(vec![0.0, 1.0, 2.0, 3.0]), [1.0], Vec::<f64>::new());
        let next = problem.continued_from(1.5, vec![0.5], vec![]);
        assert_eq!(next.tout, Tout::Points(vec![1.5, 2.0, 3.0]));
        assert_eq!(next.y0, Values::ByIndex(vec![0.5]));

        let problem = Problem::new(Tout::End(4.0), [1.0], Vec::<f64>::new());
        assert_eq!(
            problem.continued_from(1.0, vec![0.1], vec![]).tout,
            Tout::Span(1.0, 4.0)
        );
    }

    #[test]
    fn test_problem_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let problem: Problem =
            serde_json::from_str(r#"{"tout": {"End": 1.0}, "y0": {"a": 2.0}, "params": [0.5]}"#)?;
        assert_eq!(problem.tout, Tout::End(1.0));
        assert_eq!(problem.y0, Values::by_name([("a", 2.0)]));
        assert_eq!(problem.params, Values::ByIndex(vec![0.5]));
        Ok(())
    }
}
