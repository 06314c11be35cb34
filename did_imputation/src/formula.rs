use crate::{FirstStage, ImputationError};

/// A parsed first-stage formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub outcome: Option<String>,
    pub covariates: Vec<String>,
    pub fixed_effects: Vec<String>,
}

impl Formula {
    /// Parses an R-style fixed-effects formula, e.g. `"y ~ x1 + x2 | id + year"` or the
    /// one-sided `"~ 0 | id + year"`.
    ///
    /// Terms after `|` are absorbed fixed effects. `0` and `1` on the covariate side are
    /// accepted and ignored, since the fixed effects absorb the intercept.
    pub fn parse(formula_str: &str) -> Result<Formula, ImputationError> {
        let parts: Vec<&str> = formula_str.split('~').collect();
        if parts.len() != 2 {
            return Err(ImputationError::ConfigurationError(format!(
                "Invalid formula format. Expected '[outcome] ~ covariates | fixed effects', got '{}'",
                formula_str
            )));
        }

        let outcome = match parts[0].trim() {
            "" => None,
            name => Some(name.to_string()),
        };

        let rhs: Vec<&str> = parts[1].split('|').collect();
        if rhs.len() > 2 {
            return Err(ImputationError::ConfigurationError(format!(
                "Formula '{}' has more than one '|' separator",
                formula_str
            )));
        }

        let mut covariates = Vec::new();
        for term in split_terms(rhs[0]) {
            match term {
                "0" | "1" => continue,
                _ if term.starts_with("C(") || term.starts_with("factor(") => {
                    return Err(ImputationError::ConfigurationError(format!(
                        "Categorical term '{}' must be absorbed after '|'",
                        term
                    )));
                }
                _ => covariates.push(term.to_string()),
            }
        }

        let fixed_effects = rhs
            .get(1)
            .map(|fe| split_terms(fe).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Formula {
            outcome,
            covariates,
            fixed_effects,
        })
    }

    /// Turns the right-hand side into a first-stage specification. A formula without
    /// a `|` part absorbs nothing.
    pub fn into_first_stage(self) -> FirstStage {
        FirstStage {
            covariates: self.covariates,
            fixed_effects: Some(self.fixed_effects),
        }
    }
}

fn split_terms(part: &str) -> impl Iterator<Item = &str> {
    part.split('+').map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_one_sided() {
        let f = Formula::parse("~ 0 | id + year").unwrap();
        assert_eq!(f.outcome, None);
        assert!(f.covariates.is_empty());
        assert_eq!(f.fixed_effects, vec!["id", "year"]);
    }

    #[test]
    fn test_parse_with_covariates() {
        let f = Formula::parse("y ~ x1 + x2 | id + year + region").unwrap();
        assert_eq!(f.outcome.as_deref(), Some("y"));
        assert_eq!(f.covariates, vec!["x1", "x2"]);
        assert_eq!(f.fixed_effects, vec!["id", "year", "region"]);
    }

    #[test]
    fn test_parse_without_fixed_effects() {
        let f = Formula::parse("  y   ~   x  ").unwrap();
        assert_eq!(f.covariates, vec!["x"]);
        assert!(f.fixed_effects.is_empty());
        let fs = f.into_first_stage();
        assert_eq!(fs.fixed_effects, Some(Vec::new()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Formula::parse("y x | id").is_err());
        assert!(Formula::parse("y ~ x | id | year").is_err());
        assert!(matches!(
            Formula::parse("y ~ C(region) | id"),
            Err(ImputationError::ConfigurationError(_))
        ));
    }
}
