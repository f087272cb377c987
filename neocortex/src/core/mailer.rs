//! # Mailer
//!
//! Transactional e-mails for the `ENVOYER_EMAIL` task. Templates use `{{var}}`
//! placeholders; unknown variables are left in place. Without an API key the
//! mailer runs dry and only logs what it would have sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{NeocortexError, Result};

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const MAX_RETRIES: u32 = 3;
const MAX_PER_MINUTE: usize = 100;

/// Sender identity and provider credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MailerConfig {
    /// `None` (or empty) runs the mailer dry.
    pub api_key: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub endpoint: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from_email: "no-reply@sgg.ga".to_string(),
            from_name: "SGG Digital".to_string(),
            endpoint: SENDGRID_URL.to_string(),
        }
    }
}

/// The available templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    RapportSoumis,
    RapportValideSgg,
    RapportValideSgpr,
    RapportRejete,
    AlerteSysteme,
    Bienvenue,
    RappelSaisie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// What to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: Vec<Recipient>,
    pub template: TemplateId,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub cc: Vec<Recipient>,
    #[serde(default)]
    pub high_priority: bool,
}

/// Delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub dry_run: bool,
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Replaces `{{name}}` placeholders with `vars`. Missing or null values keep the placeholder.
pub fn interpolate(template: &str, vars: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if is_word(&after[..end]) => {
                let key = &after[..end];
                match vars.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                    Some(other) => out.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn html_frame(heading: &str, body: &str) -> String {
    format!(
        "<div style=\"font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;\">\
         <h2>{}</h2>{}\
         <p style=\"font-size: 11px; color: #6b7280;\">SGG Digital</p></div>",
        heading, body
    )
}

/// Renders a template with its variables.
pub fn render(template: TemplateId, vars: &Map<String, Value>) -> Rendered {
    let (subject, heading, body, text) = match template {
        TemplateId::RapportSoumis => (
            "Nouveau rapport soumis — {{ministere}}",
            "Nouveau rapport soumis",
            "<p>Le ministère <strong>{{ministere}}</strong> a soumis un rapport mensuel pour <strong>{{mois}}</strong>.</p>\
             <p>Programme : {{programme}}<br/>Pilier : {{pilier}}<br/>Soumis par : {{soumis_par}}</p>\
             <a href=\"{{lien}}\">Consulter le rapport</a>",
            "Nouveau rapport soumis par {{ministere}} pour {{mois}}. Programme: {{programme}}, Pilier: {{pilier}}. Consulter: {{lien}}",
        ),
        TemplateId::RapportValideSgg => (
            "Rapport validé (SGG) — {{ministere}}",
            "Rapport validé par le SGG",
            "<p>Le rapport de <strong>{{ministere}}</strong> pour <strong>{{mois}}</strong> a été validé par le SGG.</p>\
             <p>Validé par : <strong>{{validateur}}</strong></p><a href=\"{{lien}}\">Voir le détail</a>",
            "Rapport de {{ministere}} pour {{mois}} validé par le SGG. Validateur: {{validateur}}. Lien: {{lien}}",
        ),
        TemplateId::RapportValideSgpr => (
            "Rapport validé (SGPR) — {{ministere}}",
            "Rapport validé par le SGPR",
            "<p>Le rapport de <strong>{{ministere}}</strong> pour <strong>{{mois}}</strong> a reçu la validation finale du SGPR.</p>\
             <a href=\"{{lien}}\">Voir le rapport finalisé</a>",
            "Rapport de {{ministere}} pour {{mois}} validé par le SGPR (validation finale). Lien: {{lien}}",
        ),
        TemplateId::RapportRejete => (
            "Rapport rejeté — {{ministere}}",
            "Rapport rejeté",
            "<p>Le rapport de <strong>{{ministere}}</strong> pour <strong>{{mois}}</strong> a été rejeté.</p>\
             <p><strong>Motif :</strong> {{motif}}</p><a href=\"{{lien}}\">Corriger le rapport</a>",
            "Rapport de {{ministere}} pour {{mois}} rejeté. Motif: {{motif}}. Corrigez et resoumettez: {{lien}}",
        ),
        TemplateId::AlerteSysteme => (
            "Alerte système SGG Digital — {{niveau}}",
            "{{titre}}",
            "<p>{{description}}</p><p>Niveau : {{niveau}}<br/>Service : {{service}}<br/>Horodatage : {{timestamp}}</p>",
            "Alerte système SGG Digital — {{niveau}}: {{titre}}. {{description}}. Service: {{service}}.",
        ),
        TemplateId::Bienvenue => (
            "Bienvenue sur SGG Digital",
            "Bonjour {{nom}} !",
            "<p>Votre compte sur la plateforme SGG Digital a été créé.</p>\
             <p>Rôle : <strong>{{role}}</strong><br/>Institution : <strong>{{institution}}</strong></p>\
             <a href=\"{{lien}}\">Accéder à votre espace</a>",
            "Bienvenue {{nom}} sur SGG Digital ! Rôle: {{role}}, Institution: {{institution}}. Accès: {{lien}}",
        ),
        TemplateId::RappelSaisie => (
            "Rappel : Saisie mensuelle en attente — {{mois}}",
            "Saisie mensuelle en attente",
            "<p>Bonjour <strong>{{nom}}</strong>,</p>\
             <p>Le rapport mensuel de <strong>{{ministere}}</strong> pour <strong>{{mois}}</strong> n'a pas encore été soumis.</p>\
             <p>Date limite : <strong>{{date_limite}}</strong></p><a href=\"{{lien}}\">Compléter la saisie</a>",
            "Rappel: Le rapport mensuel de {{ministere}} pour {{mois}} est en attente. Date limite: {{date_limite}}. Lien: {{lien}}",
        ),
    };
    Rendered {
        subject: interpolate(subject, vars),
        html: interpolate(&html_frame(heading, body), vars),
        text: interpolate(text, vars),
    }
}

/// SendGrid client with dry-run mode, retries and a per-minute cap.
#[derive(Clone)]
pub struct Mailer {
    config: MailerConfig,
    client: reqwest::Client,
    sent: Arc<Mutex<VecDeque<Instant>>>,
}

impl Mailer {
    pub fn new(config: MailerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            sent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.api_key.as_deref().is_none_or(str::is_empty)
    }

    /// Renders and sends a message. Provider failures are reported in the result.
    pub async fn send(&self, payload: &EmailPayload) -> EmailResult {
        let rendered = render(payload.template, &payload.variables);

        if self.is_dry_run() {
            let to: Vec<&str> = payload.to.iter().map(|r| r.email.as_str()).collect();
            info!("[Mailer] DRY RUN to {} | {}", to.join(", "), rendered.subject);
            return EmailResult {
                success: true,
                message_id: Some(format!("dry-run-{}", chrono::Utc::now().timestamp_millis())),
                error: None,
                dry_run: true,
            };
        }

        if !self.check_rate_limit() {
            warn!("[Mailer] Rate limit reached, waiting 5s");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        let body = self.request_body(payload, &rendered);
        let mut attempt = 1;
        loop {
            match self.post(&body).await {
                Ok(message_id) => {
                    self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push_back(Instant::now());
                    return EmailResult { success: true, message_id, error: None, dry_run: false };
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let delay = Duration::from_secs(2u64.pow(attempt));
                    warn!("[Mailer] Retry {}/{} in {:?}: {}", attempt, MAX_RETRIES, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return EmailResult {
                        success: false,
                        message_id: None,
                        error: Some(e.to_string()),
                        dry_run: false,
                    };
                }
            }
        }
    }

    fn check_rate_limit(&self) -> bool {
        let mut sent = self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = Duration::from_secs(60);
        while sent.front().is_some_and(|t| t.elapsed() > window) {
            sent.pop_front();
        }
        sent.len() < MAX_PER_MINUTE
    }

    fn request_body(&self, payload: &EmailPayload, rendered: &Rendered) -> Value {
        let mut personalization = json!({ "to": payload.to });
        if !payload.cc.is_empty() {
            personalization["cc"] = json!(payload.cc);
        }
        let mut body = json!({
            "personalizations": [personalization],
            "from": { "email": self.config.from_email, "name": self.config.from_name },
            "subject": rendered.subject,
            "content": [
                { "type": "text/plain", "value": rendered.text },
                { "type": "text/html", "value": rendered.html },
            ],
        });
        if payload.high_priority {
            body["headers"] = json!({ "X-Priority": "1" });
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<Option<String>> {
        let key = self.config.api_key.as_deref().unwrap_or_default();
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| NeocortexError::Mail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NeocortexError::Mail(format!("{}: {}", status, text)));
        }
        Ok(response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn interpolation_replaces_known_and_keeps_unknown() {
        let v = vars(json!({"nom": "Awa", "n": 3, "ok": true, "vide": null}));
        assert_eq!(interpolate("Bonjour {{nom}}", &v), "Bonjour Awa");
        assert_eq!(interpolate("{{n}} / {{ok}}", &v), "3 / true");
        assert_eq!(interpolate("{{absent}} {{vide}}", &v), "{{absent}} {{vide}}");
        assert_eq!(interpolate("{{ pas un mot }}", &v), "{{ pas un mot }}");
        assert_eq!(interpolate("fin {{", &v), "fin {{");
    }

    #[test]
    fn templates_render_subject_and_bodies() {
        let v = vars(json!({"ministere": "Santé", "mois": "mars", "motif": "incomplet", "lien": "/r/1"}));
        let r = render(TemplateId::RapportRejete, &v);
        assert_eq!(r.subject, "Rapport rejeté — Santé");
        assert!(r.text.contains("Motif: incomplet"));
        assert!(r.html.contains("href=\"/r/1\""));
    }

    #[test]
    fn template_ids_use_snake_case() {
        let id: TemplateId = serde_json::from_value(json!("rapport_valide_sgg")).unwrap();
        assert_eq!(id, TemplateId::RapportValideSgg);
    }

    #[tokio::test]
    async fn without_key_the_mailer_runs_dry() {
        let mailer = Mailer::new(MailerConfig::default());
        assert!(mailer.is_dry_run());
        let payload = EmailPayload {
            to: vec![Recipient { email: "a@sgg.ga".into(), name: None }],
            template: TemplateId::Bienvenue,
            variables: vars(json!({"nom": "Awa"})),
            cc: vec![],
            high_priority: false,
        };
        let result = mailer.send(&payload).await;
        assert!(result.success);
        assert!(result.dry_run);
        assert!(result.message_id.unwrap().starts_with("dry-run-"));
    }

    #[test]
    fn request_body_carries_cc_and_priority() {
        let mut config = MailerConfig::default();
        config.api_key = Some("SG.test".into());
        let mailer = Mailer::new(config);
        let payload = EmailPayload {
            to: vec![Recipient { email: "a@sgg.ga".into(), name: Some("A".into()) }],
            template: TemplateId::AlerteSysteme,
            variables: Map::new(),
            cc: vec![Recipient { email: "b@sgg.ga".into(), name: None }],
            high_priority: true,
        };
        let body = mailer.request_body(&payload, &render(payload.template, &payload.variables));
        assert_eq!(body["personalizations"][0]["cc"][0]["email"], "b@sgg.ga");
        assert_eq!(body["headers"]["X-Priority"], "1");
        assert_eq!(body["from"]["email"], "no-reply@sgg.ga");
    }
}
