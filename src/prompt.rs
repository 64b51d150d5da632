//! Generation instruction templates.
//!
//! Builds the instruction sent to the image-generation capability from a
//! category template, the target improvements, the elements that must
//! survive regeneration untouched, and (on retries) the prior attempt's
//! critique. A caller-supplied override bypasses all of it.

use serde::{Deserialize, Serialize};

/// Inputs to one composed instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSpec {
    /// Image category driving template selection (e.g. "lifestyle").
    pub category: String,
    /// Enhancement requested for categories without a dedicated template.
    pub enhancement_type: String,
    /// What the regenerated image must improve.
    #[serde(default)]
    pub target_improvements: Vec<String>,
    /// What must be carried over exactly from the source image.
    #[serde(default)]
    pub preserve_elements: Vec<String>,
    /// Feedback from the previous attempt's verification, present on
    /// retries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_critique: Option<CritiqueContext>,
    /// Verbatim caller override; when set, nothing else is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_override: Option<String>,
}

/// Verification feedback folded into a retry instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CritiqueContext {
    pub critique: String,
    #[serde(default)]
    pub failed_checks: Vec<String>,
}

/// Build the generation instruction for one attempt.
pub fn compose(spec: &PromptSpec) -> String {
    if let Some(override_text) = &spec.user_override {
        return override_text.clone();
    }

    let mut prompt = String::new();

    // Feedback first: on a retry the model must know what failed before
    // it reads the base instruction again.
    if let Some(critique) = &spec.prior_critique {
        prompt.push_str("## Previous attempt feedback\n\n");
        prompt.push_str(
            "The previous regeneration was rejected by verification. \
             Address every point below in this attempt.\n\n",
        );
        if !critique.failed_checks.is_empty() {
            prompt.push_str("Failed checks:\n");
            for check in &critique.failed_checks {
                prompt.push_str(&format!("- {}\n", check));
            }
            prompt.push('\n');
        }
        if !critique.critique.is_empty() {
            prompt.push_str(&format!("Reviewer critique: {}\n\n", critique.critique));
        }
    }

    prompt.push_str(&category_template(&spec.category, &spec.enhancement_type));
    prompt.push('\n');

    if !spec.preserve_elements.is_empty() {
        prompt.push_str("\n## Preserve exactly\n\n");
        prompt.push_str(
            "The following elements must appear unchanged in the output:\n",
        );
        for element in &spec.preserve_elements {
            prompt.push_str(&format!("- {}\n", element));
        }
    }

    if !spec.target_improvements.is_empty() {
        prompt.push_str("\n## Target improvements\n\n");
        for improvement in &spec.target_improvements {
            prompt.push_str(&format!("- {}\n", improvement));
        }
    }

    prompt
}

/// Category-specific base instruction. Unknown categories fall back to a
/// generic template parameterized by the enhancement type.
fn category_template(category: &str, enhancement_type: &str) -> String {
    match category.to_ascii_lowercase().as_str() {
        "lifestyle" => "# Lifestyle scene\n\n\
             Place the product in a natural, aspirational real-world \
             setting. Keep the product itself photographically accurate \
             and clearly the hero of the frame; the environment supports, \
             never competes."
            .to_string(),
        "infographic" => "# Infographic\n\n\
             Produce a clean marketplace infographic around the product: \
             legible callouts, accurate feature labels, high-contrast \
             text. No invented specifications."
            .to_string(),
        "in-use" | "in_use" => "# In-use demonstration\n\n\
             Show the product actively being used the way a buyer would \
             use it. Hands and context must look natural; the product \
             must remain identical to the source image."
            .to_string(),
        "comparison" => "# Comparison layout\n\n\
             Produce a side-by-side layout contrasting the product with \
             the alternative shown. Keep both sides honestly represented \
             and visually balanced."
            .to_string(),
        "size-reference" | "size_reference" => "# Size reference\n\n\
             Show the product next to a familiar object or human element \
             that communicates its true physical size. Proportions must \
             be accurate."
            .to_string(),
        _ => format!(
            "# Product image enhancement\n\n\
             Regenerate this product image with the following enhancement: \
             {}. Keep the product photographically accurate.",
            enhancement_type
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> PromptSpec {
        PromptSpec {
            category: "lifestyle".into(),
            enhancement_type: "background cleanup".into(),
            target_improvements: vec!["remove promotional text".into()],
            preserve_elements: vec!["brand logo".into(), "product color".into()],
            prior_critique: None,
            user_override: None,
        }
    }

    #[test]
    fn user_override_is_used_verbatim() {
        let mut spec = base_spec();
        spec.user_override = Some("just make the background white".into());
        assert_eq!(compose(&spec), "just make the background white");
    }

    #[test]
    fn known_category_selects_its_template() {
        let prompt = compose(&base_spec());
        assert!(prompt.contains("Lifestyle scene"));

        let mut spec = base_spec();
        spec.category = "infographic".into();
        assert!(compose(&spec).contains("Infographic"));

        spec.category = "size-reference".into();
        assert!(compose(&spec).contains("Size reference"));
    }

    #[test]
    fn unknown_category_falls_back_to_enhancement_type() {
        let mut spec = base_spec();
        spec.category = "hero-banner".into();
        let prompt = compose(&spec);
        assert!(prompt.contains("Product image enhancement"));
        assert!(prompt.contains("background cleanup"));
    }

    #[test]
    fn preserve_and_improvement_sections_list_entries() {
        let prompt = compose(&base_spec());
        assert!(prompt.contains("Preserve exactly"));
        assert!(prompt.contains("- brand logo"));
        assert!(prompt.contains("- product color"));
        assert!(prompt.contains("Target improvements"));
        assert!(prompt.contains("- remove promotional text"));
    }

    #[test]
    fn empty_sections_are_omitted_entirely() {
        let mut spec = base_spec();
        spec.preserve_elements.clear();
        spec.target_improvements.clear();
        let prompt = compose(&spec);
        assert!(!prompt.contains("Preserve exactly"));
        assert!(!prompt.contains("Target improvements"));
    }

    #[test]
    fn first_attempt_never_contains_feedback() {
        let prompt = compose(&base_spec());
        assert!(!prompt.contains("Previous attempt feedback"));
        assert!(!prompt.contains("Failed checks"));
    }

    #[test]
    fn retry_leads_with_failed_checks_and_critique() {
        let mut spec = base_spec();
        spec.prior_critique = Some(CritiqueContext {
            critique: "logo was warped".into(),
            failed_checks: vec!["identity".into(), "text-layout".into()],
        });
        let prompt = compose(&spec);
        let feedback_pos = prompt.find("Previous attempt feedback").unwrap();
        let template_pos = prompt.find("Lifestyle scene").unwrap();
        assert!(feedback_pos < template_pos);
        assert!(prompt.contains("- identity"));
        assert!(prompt.contains("- text-layout"));
        assert!(prompt.contains("logo was warped"));
    }

    #[test]
    fn retry_with_empty_failed_checks_still_folds_critique() {
        let mut spec = base_spec();
        spec.prior_critique = Some(CritiqueContext {
            critique: "colors drifted".into(),
            failed_checks: Vec::new(),
        });
        let prompt = compose(&spec);
        assert!(!prompt.contains("Failed checks"));
        assert!(prompt.contains("colors drifted"));
    }
}
