//! # Prefrontal Cortex: Decisions & Workflows
//!
//! Multi-criteria scoring (enriched with the adaptive weights of the
//! plasticity module) and the state machines of the administrative
//! workflows. Every decision and every transition attempt is audited.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::core::hippocampus::Hippocampus;
use crate::core::limbic::{EmitOptions, SignalBus};
use crate::core::plasticity::Plasticity;
use crate::core::signal::{
    weighted_score, ActionCategory, ActionRecord, Actor, Decision, DecisionResult, SignalType,
    Thresholds, WeightedScore,
};
use crate::error::Result;

/// Config key of the auto-approval threshold.
pub const KEY_APPROVE_THRESHOLD: &str = "prefrontal.score_seuil_auto_approve";
const DEFAULT_APPROVE_THRESHOLD: f64 = 0.85;
const DEFAULT_REJECT_THRESHOLD: f64 = 0.3;

type Table = &'static [(&'static str, &'static [&'static str])];

const NOMINATION: Table = &[
    ("brouillon", &["soumis_sg"]),
    ("soumis_sg", &["consolide_sg", "rejete_sg"]),
    ("consolide_sg", &["soumis_sgg"]),
    ("soumis_sgg", &["en_instruction", "rejete_sgg"]),
    ("en_instruction", &["valide_sgg", "rejete_sgg", "retourne"]),
    ("valide_sgg", &["soumis_conseil", "en_attente_signature"]),
    ("soumis_conseil", &["approuve_conseil", "rejete_conseil"]),
    ("approuve_conseil", &["en_attente_signature"]),
    ("en_attente_signature", &["signe", "rejete"]),
    ("signe", &["publie"]),
    ("retourne", &["soumis_sg"]),
];

const TEXTE_LEGISLATIF: Table = &[
    ("brouillon", &["depose"]),
    ("depose", &["en_commission"]),
    ("en_commission", &["adopte_commission", "amende", "rejete_commission"]),
    ("amende", &["en_commission"]),
    ("adopte_commission", &["seance_pleniere"]),
    ("seance_pleniere", &["adopte", "rejete"]),
    ("adopte", &["promulgue"]),
    ("promulgue", &["publie_jo"]),
];

const PTM_INITIATIVE: Table = &[
    ("brouillon", &["soumis_sg"]),
    ("soumis_sg", &["consolide_sg", "rejete_sg"]),
    ("consolide_sg", &["soumis_sgg"]),
    ("soumis_sgg", &["valide_sgg", "rejete_sgg"]),
    ("valide_sgg", &["inscrit_ptg"]),
    ("rejete_sgg", &["brouillon"]),
    ("rejete_sg", &["brouillon"]),
];

const RAPPORT_GAR: Table = &[
    ("brouillon", &["soumis"]),
    ("soumis", &["valide", "rejete"]),
    ("rejete", &["brouillon"]),
];

fn workflow(module: &str) -> Option<Table> {
    match module {
        "nomination" => Some(NOMINATION),
        "texte_legislatif" => Some(TEXTE_LEGISLATIF),
        "ptm_initiative" => Some(PTM_INITIATIVE),
        "rapport_gar" => Some(RAPPORT_GAR),
        _ => None,
    }
}

/// Whether a transition is allowed, and where the current status may go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionCheck {
    pub autorise: bool,
    pub transitions_valides: Vec<String>,
}

/// Checks a transition against the workflow of `module`.
pub fn validate_transition(module: &str, from: &str, to: &str) -> TransitionCheck {
    let targets: &[&str] = workflow(module)
        .and_then(|t| t.iter().find(|(state, _)| *state == from))
        .map(|(_, targets)| *targets)
        .unwrap_or(&[]);
    TransitionCheck {
        autorise: targets.contains(&to),
        transitions_valides: targets.iter().map(|s| s.to_string()).collect(),
    }
}

/// Outcome of [`Prefrontal::execute_transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub succes: bool,
    pub message: String,
}

/// Optional overrides and audit context of [`Prefrontal::evaluate`].
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    pub auto_approve: Option<f64>,
    pub auto_reject: Option<f64>,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub user_id: Option<String>,
}

/// Inputs of an auto-approval evaluation, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalCriteria {
    pub completude: f64,
    pub delai: f64,
    pub historique: f64,
    pub conformite: f64,
    pub urgence: Option<f64>,
}

impl ApprovalCriteria {
    fn scores(&self) -> Vec<WeightedScore> {
        let mut scores = vec![
            WeightedScore::labelled(self.completude, 3.0, "completude"),
            WeightedScore::labelled(self.delai, 2.0, "respect_delai"),
            WeightedScore::labelled(self.historique, 2.0, "historique_auteur"),
            WeightedScore::labelled(self.conformite, 4.0, "conformite_reglementaire"),
        ];
        if let Some(urgence) = self.urgence {
            scores.push(WeightedScore::labelled(urgence, 1.0, "urgence"));
        }
        scores
    }
}

#[derive(Clone)]
pub struct Prefrontal {
    plasticity: Plasticity,
    hippocampus: Hippocampus,
    bus: SignalBus,
}

impl Prefrontal {
    pub fn new(plasticity: Plasticity, hippocampus: Hippocampus, bus: SignalBus) -> Self {
        Self { plasticity, hippocampus, bus }
    }

    /// Scores `criteria` for `signal_type` and records the decision.
    pub async fn evaluate(
        &self,
        signal_type: &str,
        criteria: Vec<WeightedScore>,
        options: EvaluateOptions,
    ) -> Result<DecisionResult> {
        let auto_approve = match options.auto_approve {
            Some(v) => v,
            None => self.plasticity.read_or(KEY_APPROVE_THRESHOLD, DEFAULT_APPROVE_THRESHOLD).await,
        };
        let auto_reject = options.auto_reject.unwrap_or(DEFAULT_REJECT_THRESHOLD);

        let adaptive = self.plasticity.weights(signal_type).await?;
        let details: Vec<WeightedScore> = criteria
            .into_iter()
            .map(|mut c| {
                let label = c.label.as_deref().unwrap_or("");
                if let Some(w) = adaptive.iter().find(|w| w.regle == label) {
                    c.poids *= w.poids;
                }
                c
            })
            .collect();

        let score = weighted_score(&details);
        let decision = if score >= auto_approve {
            Decision::Approve
        } else if score <= auto_reject {
            Decision::Reject
        } else {
            Decision::Review
        };
        let seuils = Thresholds { auto_approve, auto_reject };

        let mut record = ActionRecord::new(
            "DECISION_EVALUEE",
            ActionCategory::Systeme,
            options.entite_type.as_deref().unwrap_or("decision"),
        );
        record.entite_id = options.entite_id;
        record.user_id = options.user_id;
        record.details = json!({
            "signalType": signal_type,
            "score": score,
            "decision": decision,
            "criteres": details,
            "seuils": seuils,
        });
        self.hippocampus.record(record).await;

        Ok(DecisionResult { score, decision, details, seuils })
    }

    /// Validates and performs a workflow transition, emitting and auditing it.
    pub async fn execute_transition(
        &self,
        module: &str,
        entite_id: &str,
        from: &str,
        to: &str,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let check = validate_transition(module, from, to);

        if !check.autorise {
            let mut record = ActionRecord::new("TRANSITION_REFUSEE", ActionCategory::Securite, module)
                .with_actor(actor);
            record.entite_id = Some(entite_id.to_string());
            record.details = json!({
                "statutActuel": from,
                "nouveauStatut": to,
                "transitionsValides": check.transitions_valides,
                "commentaire": comment,
            });
            self.hippocampus.record(record).await;

            return Ok(TransitionOutcome {
                succes: false,
                message: format!(
                    "Transition de \"{}\" vers \"{}\" non autorisée. Transitions valides: {}",
                    from,
                    to,
                    check.transitions_valides.join(", ")
                ),
            });
        }

        let kind = format!("{}_TRANSITION", module.to_uppercase())
            .parse::<SignalType>()
            .unwrap_or(SignalType::WorkflowApprouve);
        self.bus
            .emit_business(
                kind,
                module,
                entite_id,
                json!({
                    "statutAvant": from,
                    "statutApres": to,
                    "commentaire": comment,
                    "user": { "id": actor.user_id, "email": actor.email, "role": actor.role },
                }),
                EmitOptions::default(),
            )
            .await?;

        let mut record = ActionRecord::new("TRANSITION_EXECUTEE", ActionCategory::Metier, module)
            .with_actor(actor);
        record.entite_id = Some(entite_id.to_string());
        record.details = json!({
            "avant": { "statut": from },
            "apres": { "statut": to },
            "commentaire": comment,
        });
        self.hippocampus.record(record).await;

        info!("[Prefrontal] {} {}: {} -> {}", module, entite_id, from, to);
        Ok(TransitionOutcome {
            succes: true,
            message: format!("Transition réussie: {} → {}", from, to),
        })
    }

    /// Scores a file for auto-approval under `<MODULE>_EVALUATION`.
    pub async fn evaluate_auto_approval(
        &self,
        module: &str,
        entite_id: &str,
        criteria: &ApprovalCriteria,
        user_id: Option<&str>,
    ) -> Result<DecisionResult> {
        self.evaluate(
            &format!("{}_EVALUATION", module.to_uppercase()),
            criteria.scores(),
            EvaluateOptions {
                entite_type: Some(module.to_string()),
                entite_id: Some(entite_id.to_string()),
                user_id: user_id.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }
}
