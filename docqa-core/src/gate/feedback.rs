//! Gate feedback: turns a failed iteration into guidance for the next generation.

use crate::config::GateConfig;
use crate::run::IterationEvaluation;

/// Errors and corrections carried over from the accuracy check.
const MAX_ACCURACY_ITEMS: usize = 3;
const MAX_UNVERIFIED_CLAIMS: usize = 10;

/// Format a failed iteration into a revision brief for the generator.
pub fn format_feedback(config: &GateConfig, evaluation: &IterationEvaluation) -> String {
    let quality = evaluation.average_score.unwrap_or(0.0);
    let mut feedback = String::from("## Quality Check Failed\n\n");

    feedback.push_str(&format!(
        "Quality score: {quality:.1}/100 (threshold: {:.0})\n\n",
        config.quality_threshold
    ));

    // Judges
    let judges: Vec<_> = evaluation
        .judges
        .iter()
        .filter(|j| !j.feedback.trim().is_empty() || j.score < config.quality_threshold)
        .collect();
    if !judges.is_empty() {
        feedback.push_str("### Reviewer Feedback\n");
        for judge in judges {
            let comment = if judge.feedback.trim().is_empty() {
                "no comment"
            } else {
                judge.feedback.trim()
            };
            feedback.push_str(&format!("- {} ({:.0}): {}\n", judge.judge, judge.score, comment));

            let unmet: Vec<String> = judge
                .criteria
                .named()
                .iter()
                .filter(|(_, score)| *score < config.quality_threshold)
                .map(|(name, score)| format!("{name} {score:.0}"))
                .collect();
            if !unmet.is_empty() {
                feedback.push_str(&format!("  Unmet criteria: {}\n", unmet.join(", ")));
            }
        }
        feedback.push('\n');
    }

    // Accuracy
    if let Some(accuracy) = &evaluation.accuracy
        && accuracy.score < config.accuracy_threshold
    {
        feedback.push_str(&format!(
            "### Accuracy\nAccuracy score: {:.0}/100 (threshold: {:.0})\n",
            accuracy.score, config.accuracy_threshold
        ));
        if !accuracy.errors.is_empty() {
            feedback.push_str("Identified errors:\n");
            for error in accuracy.errors.iter().take(MAX_ACCURACY_ITEMS) {
                feedback.push_str(&format!("- {error}\n"));
            }
        }
        if !accuracy.corrections.is_empty() {
            feedback.push_str("Suggested corrections:\n");
            for correction in accuracy.corrections.iter().take(MAX_ACCURACY_ITEMS) {
                feedback.push_str(&format!("- {correction}\n"));
            }
        }
        feedback.push('\n');
    }

    // Claims
    let unverified: Vec<_> = evaluation.claims.iter().filter(|c| !c.verified).collect();
    if !unverified.is_empty() {
        feedback.push_str(&format!(
            "### Claims Not Supported by the Documentation ({})\n",
            unverified.len()
        ));
        for (i, claim) in unverified.iter().enumerate().take(MAX_UNVERIFIED_CLAIMS) {
            feedback.push_str(&format!("{}. {}\n", i + 1, claim.text));
        }
        if unverified.len() > MAX_UNVERIFIED_CLAIMS {
            feedback.push_str(&format!(
                "... and {} more\n",
                unverified.len() - MAX_UNVERIFIED_CLAIMS
            ));
        }
        feedback.push('\n');
    }

    feedback.push_str(
        "Revise the answer to address these issues. Remove or correct unsupported claims rather than adding new ones.\n",
    );
    feedback
}
