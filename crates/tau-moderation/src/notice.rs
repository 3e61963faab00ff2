//! Chat-facing moderation texts.
//!
//! Templates use `{username}`, `{violations}` and `{minutes}` placeholders and
//! are sent with HTML parse mode, so substituted values are escaped.

use std::time::Duration;

use tau_moderation_types::{Violation, ViolationSet};

/// Texts posted by the moderation bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationMessages {
    pub welcome: String,
    pub unauthorized_chat: String,
    pub warning: String,
    pub kick: String,
}

impl Default for ModerationMessages {
    fn default() -> Self {
        Self {
            welcome: "🤖 Bot de moderación iniciado\n✅ Monitoreando foto de perfil y @username"
                .to_string(),
            unauthorized_chat: "Este bot solo funciona en el grupo autorizado.".to_string(),
            warning: "⚠️ @{username}, tu perfil no cumple las normas del grupo: {violations}.\n⏳ Tienes {minutes} minutos para corregirlo o serás expulsado."
                .to_string(),
            kick: "❌ @{username} ha sido expulsado.\n📝 Motivo: {violations}.".to_string(),
        }
    }
}

impl ModerationMessages {
    /// Challenge posted when a violation is first detected.
    pub fn render_warning(
        &self,
        username: &str,
        violations: &ViolationSet,
        grace_period: Duration,
    ) -> String {
        let minutes = grace_period.as_secs().div_ceil(60).max(1);
        render_template(&self.warning, username, violations)
            .replace("{minutes}", &minutes.to_string())
    }

    /// Notice posted after a ban, citing the violations still present.
    pub fn render_kick(&self, username: &str, violations: &ViolationSet) -> String {
        render_template(&self.kick, username, violations)
    }
}

/// Human phrase for one violation.
pub fn violation_phrase(violation: Violation) -> &'static str {
    match violation {
        Violation::NoPhoto => "no tienes foto de perfil",
        Violation::PrivatePhoto => "tu foto de perfil es privada",
        Violation::NoHandle => "no tienes @username",
    }
}

/// Comma-joined phrases for every set flag.
pub fn describe_violations(violations: &ViolationSet) -> String {
    violations
        .violations()
        .into_iter()
        .map(violation_phrase)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_template(template: &str, username: &str, violations: &ViolationSet) -> String {
    template
        .replace("{username}", &escape_html(username))
        .replace("{violations}", &describe_violations(violations))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
