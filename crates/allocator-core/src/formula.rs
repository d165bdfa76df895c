//! Cluster-name formula compilation and evaluation
//!
//! Formulas correlate billed tag values with the cluster names found in
//! utilization reports. Each formula is a `+`-joined sequence of terms:
//! a quoted literal, a tag reference, or a tag reference with a chain of
//! `.toUpper()` / `.toLower()` / `.regex("pattern")` transforms.
//! Formulas are compiled once at configuration load and evaluated per
//! billed group.

use regex::Regex;

use crate::config::ConfigError;

/// Evaluates the configured formulas over billed tag vectors
#[derive(Debug)]
pub struct FormulaEvaluator {
    formulas: Vec<Formula>,
    /// Tag keys referenced by any formula, in first-reference order
    referenced: Vec<String>,
    /// Indices of `referenced` within the tag-key universe
    referenced_indices: Vec<usize>,
}

/// One compiled formula
#[derive(Debug)]
struct Formula {
    terms: Vec<Term>,
}

#[derive(Debug)]
struct Term {
    source: TermSource,
    transforms: Vec<Transform>,
}

#[derive(Debug)]
enum TermSource {
    Literal(String),
    /// Index into the tag-key universe
    TagRef(usize),
}

#[derive(Debug)]
enum Transform {
    Upper,
    Lower,
    /// Full-string match; group 1 if the pattern captures, else the
    /// whole match, else the empty string
    Regex(Regex),
}

impl FormulaEvaluator {
    /// Compile formulas against the configured tag-key universe.
    ///
    /// Fails on malformed formula text or references to unknown tags,
    /// so bad configuration surfaces before any report is read.
    pub fn compile(formulae: &[String], tag_keys: &[String]) -> Result<Self, ConfigError> {
        let mut formulas = Vec::with_capacity(formulae.len());
        let mut referenced: Vec<String> = Vec::new();
        let mut referenced_indices: Vec<usize> = Vec::new();

        for text in formulae {
            let terms = parse_formula(text, tag_keys)?;
            for term in &terms {
                if let TermSource::TagRef(idx) = term.source {
                    if !referenced_indices.contains(&idx) {
                        referenced_indices.push(idx);
                        referenced.push(tag_keys[idx].clone());
                    }
                }
            }
            formulas.push(Formula { terms });
        }

        Ok(Self {
            formulas,
            referenced,
            referenced_indices,
        })
    }

    /// Tag keys used by any configured formula, in first-reference order
    pub fn referenced_tags(&self) -> &[String] {
        &self.referenced
    }

    /// Values of the referenced tags for one billed tag vector, used to
    /// build an [`crate::models::AllocationKey`]
    pub fn referenced_tag_values(&self, tags: &[String]) -> Vec<String> {
        self.referenced_indices
            .iter()
            .map(|&i| tags.get(i).cloned().unwrap_or_default())
            .collect()
    }

    /// Candidate cluster names in formula declaration order, deduped.
    ///
    /// A formula referencing an absent (empty) tag value contributes no
    /// candidate. A regex that fails to match yields an empty segment
    /// which still concatenates.
    pub fn candidate_names(&self, tags: &[String]) -> Vec<String> {
        let mut names = Vec::with_capacity(self.formulas.len());
        for formula in &self.formulas {
            if let Some(name) = formula.evaluate(tags) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

impl Formula {
    /// Returns None when any referenced tag value is absent
    fn evaluate(&self, tags: &[String]) -> Option<String> {
        let mut out = String::new();
        for term in &self.terms {
            let mut value = match &term.source {
                TermSource::Literal(s) => s.clone(),
                TermSource::TagRef(idx) => {
                    let v = tags.get(*idx).map(String::as_str).unwrap_or("");
                    if v.is_empty() {
                        return None;
                    }
                    v.to_string()
                }
            };
            for transform in &term.transforms {
                value = transform.apply(&value);
            }
            out.push_str(&value);
        }
        Some(out)
    }
}

impl Transform {
    fn apply(&self, value: &str) -> String {
        match self {
            Transform::Upper => value.to_uppercase(),
            Transform::Lower => value.to_lowercase(),
            Transform::Regex(re) => match re.captures(value) {
                Some(caps) => match caps.get(1) {
                    Some(group) => group.as_str().to_string(),
                    None => caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string(),
                },
                None => String::new(),
            },
        }
    }
}

/// Parse one formula into its term sequence
fn parse_formula(text: &str, tag_keys: &[String]) -> Result<Vec<Term>, ConfigError> {
    let bad = |reason: &str| ConfigError::InvalidFormula {
        formula: text.to_string(),
        reason: reason.to_string(),
    };

    let mut terms = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;

    loop {
        skip_whitespace(&chars, &mut pos);
        if pos >= chars.len() {
            return Err(bad("expected a term"));
        }

        let term = if chars[pos] == '"' {
            let literal = read_quoted(&chars, &mut pos).ok_or_else(|| bad("unterminated string literal"))?;
            Term {
                source: TermSource::Literal(literal),
                transforms: Vec::new(),
            }
        } else {
            let name = read_identifier(&chars, &mut pos);
            if name.is_empty() {
                return Err(bad("expected a tag name or string literal"));
            }
            let index = tag_keys
                .iter()
                .position(|k| k == &name)
                .ok_or_else(|| ConfigError::UnknownTagKey {
                    key: name.clone(),
                    context: format!("formula \"{}\"", text),
                })?;
            let transforms = read_transforms(&chars, &mut pos, text)?;
            Term {
                source: TermSource::TagRef(index),
                transforms,
            }
        };
        terms.push(term);

        skip_whitespace(&chars, &mut pos);
        if pos >= chars.len() {
            break;
        }
        if chars[pos] != '+' {
            return Err(bad("expected '+' between terms"));
        }
        pos += 1;
    }

    Ok(terms)
}

fn read_transforms(chars: &[char], pos: &mut usize, text: &str) -> Result<Vec<Transform>, ConfigError> {
    let bad = |reason: String| ConfigError::InvalidFormula {
        formula: text.to_string(),
        reason,
    };

    let mut transforms = Vec::new();
    while *pos < chars.len() && chars[*pos] == '.' {
        *pos += 1;
        let func = read_identifier(chars, pos);
        if *pos >= chars.len() || chars[*pos] != '(' {
            return Err(bad(format!("expected '(' after .{}", func)));
        }
        *pos += 1;
        match func.as_str() {
            "toUpper" => transforms.push(Transform::Upper),
            "toLower" => transforms.push(Transform::Lower),
            "regex" => {
                skip_whitespace(chars, pos);
                if *pos >= chars.len() || chars[*pos] != '"' {
                    return Err(bad("regex() requires a quoted pattern".to_string()));
                }
                let pattern = read_quoted(chars, pos)
                    .ok_or_else(|| bad("unterminated regex pattern".to_string()))?;
                // Full-string semantics: anchor the user's pattern without
                // disturbing its capture-group numbering.
                let anchored = format!("^(?:{})$", pattern);
                let re = Regex::new(&anchored)
                    .map_err(|e| bad(format!("invalid regex \"{}\": {}", pattern, e)))?;
                transforms.push(Transform::Regex(re));
                skip_whitespace(chars, pos);
            }
            other => return Err(bad(format!("unknown function .{}()", other))),
        }
        if *pos >= chars.len() || chars[*pos] != ')' {
            return Err(bad(format!("expected ')' to close .{}(", func)));
        }
        *pos += 1;
    }
    Ok(transforms)
}

/// Read a `"..."` literal, leaving pos past the closing quote
fn read_quoted(chars: &[char], pos: &mut usize) -> Option<String> {
    debug_assert_eq!(chars[*pos], '"');
    *pos += 1;
    let start = *pos;
    while *pos < chars.len() {
        if chars[*pos] == '"' {
            let s: String = chars[start..*pos].iter().collect();
            *pos += 1;
            return Some(s);
        }
        *pos += 1;
    }
    None
}

fn read_identifier(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() {
        let c = chars[*pos];
        if c.is_alphanumeric() || c == '_' || c == '-' || c == ':' {
            *pos += 1;
        } else {
            break;
        }
    }
    chars[start..*pos].iter().collect()
}

fn skip_whitespace(chars: &[char], pos: &mut usize) {
    while *pos < chars.len() && chars[*pos].is_whitespace() {
        *pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        vec!["Tag1".to_string(), "Tag2".to_string(), "Tag3".to_string()]
    }

    fn compile(formulae: &[&str]) -> FormulaEvaluator {
        let formulae: Vec<String> = formulae.iter().map(|s| s.to_string()).collect();
        FormulaEvaluator::compile(&formulae, &keys()).unwrap()
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_tag_reference() {
        let fe = compile(&["Tag3"]);
        let names = fe.candidate_names(&tags(&["One", "Two", "Three"]));
        assert_eq!(names, vec!["Three"]);
    }

    #[test]
    fn test_literal_ignores_inputs() {
        let fe = compile(&["\"foobar\""]);
        let names = fe.candidate_names(&tags(&["One", "Two", "Three"]));
        assert_eq!(names, vec!["foobar"]);
        // Literal formulas reference no tags at all
        assert!(fe.referenced_tags().is_empty());
        assert_eq!(fe.candidate_names(&tags(&["", "", ""])), vec!["foobar"]);
    }

    #[test]
    fn test_to_upper() {
        let fe = compile(&["Tag2.toUpper()"]);
        let names = fe.candidate_names(&tags(&["One", "Two", "Three"]));
        assert_eq!(names, vec!["TWO"]);
    }

    #[test]
    fn test_to_lower() {
        let fe = compile(&["Tag2.toLower()"]);
        let names = fe.candidate_names(&tags(&["One", "Two", "Three"]));
        assert_eq!(names, vec!["two"]);
    }

    #[test]
    fn test_regex_capture_group() {
        let fe = compile(&["Tag2.regex(\"Stripme-(.*)\")"]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "Three"]));
        assert_eq!(names, vec!["Two"]);
    }

    #[test]
    fn test_regex_without_group_returns_full_match() {
        let fe = compile(&["Tag2.regex(\"Stripme-.*\")"]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "Three"]));
        assert_eq!(names, vec!["Stripme-Two"]);
    }

    #[test]
    fn test_regex_is_full_string_match() {
        // Would match as a substring search; must not as a full match
        let fe = compile(&["Tag2.regex(\"ipme-(.*)\")"]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "Three"]));
        assert_eq!(names, vec![""]);
    }

    #[test]
    fn test_regex_chained_with_to_lower() {
        let fe = compile(&["Tag2.regex(\"Stripme-(.*)\").toLower()"]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "Three"]));
        assert_eq!(names, vec!["two"]);
    }

    #[test]
    fn test_concatenation() {
        let fe = compile(&["Tag1.toLower()+Tag2.regex(\"Stripme(-.*)\")"]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "Three"]));
        assert_eq!(names, vec!["one-Two"]);
    }

    #[test]
    fn test_no_match_still_concatenates_empty() {
        let fe = compile(&["Tag1.toLower()+Tag2.regex(\"k8s(-.*)\")"]);
        let names = fe.candidate_names(&tags(&["Dev", "prod-cluster", "x"]));
        assert_eq!(names, vec!["dev"]);
    }

    #[test]
    fn test_absent_tag_contributes_no_candidate() {
        let fe = compile(&["Tag2.toUpper()"]);
        assert!(fe.candidate_names(&tags(&["", "", ""])).is_empty());
    }

    #[test]
    fn test_multiple_formulae_in_order_with_dedup() {
        let fe = compile(&[
            "Tag1.toLower()+Tag2.regex(\"Stripme(-.*)\")",
            "Tag3.regex(\"k8s-(.*)\")",
            "Tag1.toLower()+Tag2.regex(\"Stripme(-.*)\")",
        ]);
        let names = fe.candidate_names(&tags(&["One", "Stripme-Two", "k8s-Three"]));
        assert_eq!(names, vec!["one-Two", "Three"]);
        assert_eq!(fe.referenced_tags(), &["Tag1", "Tag2", "Tag3"]);
    }

    #[test]
    fn test_referenced_tag_values() {
        let fe = compile(&["Tag3", "Tag1"]);
        assert_eq!(fe.referenced_tags(), &["Tag3", "Tag1"]);
        let values = fe.referenced_tag_values(&tags(&["a", "b", "c"]));
        assert_eq!(values, vec!["c", "a"]);
    }

    #[test]
    fn test_compile_errors() {
        let formulae = vec!["NoSuchTag".to_string()];
        assert!(FormulaEvaluator::compile(&formulae, &keys()).is_err());

        let formulae = vec!["Tag1.frobnicate()".to_string()];
        assert!(FormulaEvaluator::compile(&formulae, &keys()).is_err());

        let formulae = vec!["Tag1.regex(\"([unclosed\")".to_string()];
        assert!(FormulaEvaluator::compile(&formulae, &keys()).is_err());

        let formulae = vec!["\"unterminated".to_string()];
        assert!(FormulaEvaluator::compile(&formulae, &keys()).is_err());
    }
}
