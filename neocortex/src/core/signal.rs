//! # Signals, Cortex Modules and Helpers
//!
//! The vocabulary shared by every cortex module: the closed set of signal
//! types, the cortex modules that consume them, priorities, action categories
//! and the records that flow between the bus, the audit trail, the
//! notification centre and the task queue.
//!
//! Wire names (what is persisted, published and accepted over HTTP) are the
//! upper snake case identifiers used by the rest of the platform, e.g.
//! `NOMINATION_CREEE`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::NeocortexError;

/// Declares a fieldless enum whose variants map one-to-one to wire names.
///
/// Generates `as_str`, `ALL`, `Display`, `FromStr` and string based serde
/// implementations so the enum travels as its wire name everywhere.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// The wire name of this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $wire ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = NeocortexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok($name::$variant), )+
                    other => Err(NeocortexError::InvalidInput(format!(
                        "unknown {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum! {
    /// Every signal the platform can emit.
    pub enum SignalType {
        // GAR
        GarObjectifCree => "GAR_OBJECTIF_CREE",
        GarObjectifModifie => "GAR_OBJECTIF_MODIFIE",
        GarObjectifSupprime => "GAR_OBJECTIF_SUPPRIME",
        GarRapportSoumis => "GAR_RAPPORT_SOUMIS",
        GarRapportValide => "GAR_RAPPORT_VALIDE",
        GarRapportRejete => "GAR_RAPPORT_REJETE",
        // Nominations
        NominationCreee => "NOMINATION_CREEE",
        NominationModifiee => "NOMINATION_MODIFIEE",
        NominationTransition => "NOMINATION_TRANSITION",
        NominationValidee => "NOMINATION_VALIDEE",
        NominationRejetee => "NOMINATION_REJETEE",
        // Legislative cycle
        TexteLegislatifCree => "TEXTE_LEGISLATIF_CREE",
        TexteLegislatifSoumis => "TEXTE_LEGISLATIF_SOUMIS",
        TexteLegislatifModifie => "TEXTE_LEGISLATIF_MODIFIE",
        TexteLegislatifPublie => "TEXTE_LEGISLATIF_PUBLIE",
        // e-GOP
        EgopCiPlanifie => "EGOP_CI_PLANIFIE",
        EgopCiModifie => "EGOP_CI_MODIFIE",
        EgopRimCree => "EGOP_RIM_CREE",
        EgopCourrierRecu => "EGOP_COURRIER_RECU",
        EgopCourrierTraite => "EGOP_COURRIER_TRAITE",
        // Journal Officiel
        JoPublication => "JO_PUBLICATION",
        JoTexteAjoute => "JO_TEXTE_AJOUTE",
        // PTM / PTG
        PtmInitiativeCreee => "PTM_INITIATIVE_CREEE",
        PtmInitiativeSoumise => "PTM_INITIATIVE_SOUMISE",
        PtmInitiativeValidee => "PTM_INITIATIVE_VALIDEE",
        PtmInitiativeRejetee => "PTM_INITIATIVE_REJETEE",
        PtmInitiativeInscritePtg => "PTM_INITIATIVE_INSCRITE_PTG",
        // Institutions
        InstitutionCreee => "INSTITUTION_CREEE",
        InstitutionModifiee => "INSTITUTION_MODIFIEE",
        // Users
        UtilisateurConnecte => "UTILISATEUR_CONNECTE",
        UtilisateurDeconnecte => "UTILISATEUR_DECONNECTE",
        UtilisateurCree => "UTILISATEUR_CREE",
        UtilisateurModifie => "UTILISATEUR_MODIFIE",
        UtilisateurRoleChange => "UTILISATEUR_ROLE_CHANGE",
        Utilisateur2faActive => "UTILISATEUR_2FA_ACTIVE",
        // Workflow
        WorkflowDemarre => "WORKFLOW_DEMARRE",
        WorkflowApprouve => "WORKFLOW_APPROUVE",
        WorkflowRejete => "WORKFLOW_REJETE",
        WorkflowEscalade => "WORKFLOW_ESCALADE",
        WorkflowTermine => "WORKFLOW_TERMINE",
        // System
        AlerteSysteme => "ALERTE_SYSTEME",
        ConfigModifiee => "CONFIG_MODIFIEE",
        PoidsAjuste => "POIDS_AJUSTE",
        CacheInvalide => "CACHE_INVALIDE",
        TacheTerminee => "TACHE_TERMINEE",
        TacheEchouee => "TACHE_ECHOUEE",
        // Security
        SecuriteConnexionEchouee => "SECURITE_CONNEXION_ECHOUEE",
        SecuriteTokenRevoque => "SECURITE_TOKEN_REVOQUE",
        SecuriteAccesRefuse => "SECURITE_ACCES_REFUSE",
        SecuriteBruteForce => "SECURITE_BRUTE_FORCE",
    }
}

wire_enum! {
    /// The modules of the nervous system. Routed signals are addressed to these.
    pub enum CortexModule {
        /// Signal bus.
        Limbique => "LIMBIQUE",
        /// Memory and audit trail.
        Hippocampe => "HIPPOCAMPE",
        /// Decisions and workflows.
        Prefrontal => "PREFRONTAL",
        /// Dynamic configuration.
        Plasticite => "PLASTICITE",
        /// External inputs.
        Sensoriel => "SENSORIEL",
        /// Files and media.
        Visuel => "VISUEL",
        /// Notifications.
        Auditif => "AUDITIF",
        /// External actions.
        Moteur => "MOTEUR",
        /// System health.
        Monitoring => "MONITORING",
        /// Scheduled jobs.
        Circadien => "CIRCADIEN",
    }
}

wire_enum! {
    /// Category of an audited action.
    pub enum ActionCategory {
        Metier => "METIER",
        Systeme => "SYSTEME",
        Utilisateur => "UTILISATEUR",
        Securite => "SECURITE",
    }
}

wire_enum! {
    /// Signal priority. Ordering follows urgency: `Low < Normal < High < Critical`.
    pub enum Priority {
        Low => "LOW",
        Normal => "NORMAL",
        High => "HIGH",
        Critical => "CRITICAL",
    }
}

impl Priority {
    /// Processing rank used when draining the backlog; lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.rank().cmp(&self.rank())
    }
}

wire_enum! {
    /// Kind of notification shown to a user.
    pub enum NotificationKind {
        Info => "info",
        Alerte => "alerte",
        Action => "action",
        Systeme => "systeme",
    }
}

wire_enum! {
    /// Delivery channel of a notification.
    pub enum NotificationChannel {
        InApp => "in_app",
        Email => "email",
        Sms => "sms",
    }
}

wire_enum! {
    /// Lifecycle status of an asynchronous task.
    pub enum TaskStatus {
        Pending => "en_attente",
        Running => "en_cours",
        Done => "termine",
        Failed => "echoue",
        Cancelled => "annule",
    }
}

/// Where a signal comes from: a cortex module or any named producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Cortex(CortexModule),
    Named(String),
}

impl Endpoint {
    pub fn as_str(&self) -> &str {
        match self {
            Endpoint::Cortex(c) => c.as_str(),
            Endpoint::Named(s) => s.as_str(),
        }
    }

    /// Parses a stored endpoint, preferring the cortex vocabulary.
    pub fn parse(raw: &str) -> Self {
        raw.parse::<CortexModule>()
            .map(Endpoint::Cortex)
            .unwrap_or_else(|_| Endpoint::Named(raw.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CortexModule> for Endpoint {
    fn from(c: CortexModule) -> Self {
        Endpoint::Cortex(c)
    }
}

/// A weighted signal, as emitted by a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub source: Endpoint,
    pub destination: Option<Endpoint>,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub payload: Value,
    /// Confidence in `[0.0, 1.0]`.
    pub confiance: f64,
    pub priorite: Priority,
    pub correlation_id: Uuid,
    pub parent_signal_id: Option<Uuid>,
    pub ttl_seconds: Option<i64>,
}

/// A signal as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSignal {
    pub id: Uuid,
    #[serde(flatten)]
    pub signal: Signal,
    pub traite: bool,
    pub erreur: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The user performing an action, as provided by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub email: String,
    pub role: String,
}

/// An entry for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action: String,
    pub categorie: ActionCategory,
    pub entite_type: String,
    pub entite_id: Option<String>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    /// Free form details; updates carry `avant` and `apres`.
    pub details: Value,
    pub metadata: Value,
    pub correlation_id: Option<Uuid>,
    pub duration_ms: Option<i64>,
}

impl ActionRecord {
    /// A record with empty details and metadata.
    pub fn new(action: impl Into<String>, categorie: ActionCategory, entite_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            categorie,
            entite_type: entite_type.into(),
            entite_id: None,
            user_id: None,
            user_email: None,
            user_role: None,
            details: Value::Object(Map::new()),
            metadata: Value::Object(Map::new()),
            correlation_id: None,
            duration_ms: None,
        }
    }

    pub fn with_actor(mut self, actor: &Actor) -> Self {
        self.user_id = Some(actor.user_id.clone());
        self.user_email = Some(actor.email.clone());
        self.user_role = Some(actor.role.clone());
        self
    }
}

/// A notification to persist for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub canal: NotificationChannel,
    pub titre: String,
    pub message: String,
    pub lien: Option<String>,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub signal_id: Option<Uuid>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// A request for asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    /// Lower runs first. Defaults to 5.
    pub priorite: Option<i32>,
    /// Defaults to 3.
    pub max_tentatives: Option<i32>,
    pub signal_id: Option<Uuid>,
    pub created_by: Option<String>,
}

impl TaskRequest {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priorite: None,
            max_tentatives: None,
            signal_id: None,
            created_by: None,
        }
    }
}

/// One criterion of a weighted decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    /// Value in `[0.0, 1.0]`.
    pub valeur: f64,
    /// Relative weight.
    pub poids: f64,
    pub label: Option<String>,
}

impl WeightedScore {
    pub fn labelled(valeur: f64, poids: f64, label: &str) -> Self {
        Self { valeur, poids, label: Some(label.to_string()) }
    }
}

/// Outcome of a weighted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
    Review,
}

/// Thresholds used for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub auto_approve: f64,
    pub auto_reject: f64,
}

/// Result of a weighted decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub score: f64,
    pub decision: Decision,
    pub details: Vec<WeightedScore>,
    pub seuils: Thresholds,
}

/// A measurement written by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub nom: String,
    pub valeur: f64,
    pub unite: String,
    pub periode: String,
    pub dimensions: Value,
}

impl Metric {
    pub fn count(nom: &str, valeur: u64, periode: &str) -> Self {
        Self {
            nom: nom.to_string(),
            valeur: valeur as f64,
            unite: "count".to_string(),
            periode: periode.to_string(),
            dimensions: Value::Object(Map::new()),
        }
    }

    pub fn with_dimensions(mut self, dimensions: Value) -> Self {
        self.dimensions = dimensions;
        self
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A fresh id grouping related signals.
pub fn new_correlation_id() -> Uuid {
    Uuid::new_v4()
}

/// Weighted mean of the criteria, rounded to four decimals.
///
/// Returns `0.0` for an empty list or when all weights are zero.
pub fn weighted_score(scores: &[WeightedScore]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let total_weight: f64 = scores.iter().map(|s| s.poids).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    let total: f64 = scores.iter().map(|s| s.valeur * s.poids).sum();
    ((total / total_weight) * 10000.0).round() / 10000.0
}

/// Priority of a signal, derived from its wire name.
pub fn priority_for(kind: SignalType) -> Priority {
    let name = kind.as_str();
    if name.starts_with("SECURITE_") || kind == SignalType::AlerteSysteme {
        return Priority::Critical;
    }
    if name.contains("VALIDE") || name.contains("PUBLIE") || name.contains("APPROUVE") {
        return Priority::High;
    }
    if name.contains("SOUMIS") || name.contains("TRANSITION") {
        return Priority::High;
    }
    if name.starts_with("UTILISATEUR_") || name.contains("CONFIG_") {
        return Priority::Low;
    }
    Priority::Normal
}

/// Audit category for an action or signal name. Unknown names are business actions.
pub fn category_for(name: &str) -> ActionCategory {
    if name.starts_with("SECURITE_") {
        return ActionCategory::Securite;
    }
    if name.starts_with("UTILISATEUR_") {
        return ActionCategory::Utilisateur;
    }
    const SYSTEM_PREFIXES: [&str; 5] = ["ALERTE_", "CONFIG_", "CACHE_", "TACHE_", "POIDS_"];
    if SYSTEM_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return ActionCategory::Systeme;
    }
    ActionCategory::Metier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_and_system_alerts_are_critical() {
        assert_eq!(priority_for(SignalType::SecuriteBruteForce), Priority::Critical);
        assert_eq!(priority_for(SignalType::SecuriteAccesRefuse), Priority::Critical);
        assert_eq!(priority_for(SignalType::AlerteSysteme), Priority::Critical);
    }

    #[test]
    fn validations_submissions_and_transitions_are_high() {
        assert_eq!(priority_for(SignalType::GarRapportValide), Priority::High);
        assert_eq!(priority_for(SignalType::NominationValidee), Priority::High);
        assert_eq!(priority_for(SignalType::TexteLegislatifPublie), Priority::High);
        assert_eq!(priority_for(SignalType::WorkflowApprouve), Priority::High);
        assert_eq!(priority_for(SignalType::PtmInitiativeSoumise), Priority::High);
        assert_eq!(priority_for(SignalType::NominationTransition), Priority::High);
    }

    #[test]
    fn user_and_config_signals_are_low() {
        assert_eq!(priority_for(SignalType::UtilisateurConnecte), Priority::Low);
        assert_eq!(priority_for(SignalType::ConfigModifiee), Priority::Low);
    }

    #[test]
    fn everything_else_is_normal() {
        assert_eq!(priority_for(SignalType::NominationCreee), Priority::Normal);
        assert_eq!(priority_for(SignalType::JoPublication), Priority::Normal);
        assert_eq!(priority_for(SignalType::TacheEchouee), Priority::Normal);
    }

    #[test]
    fn priority_ordering_follows_urgency() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Critical.rank(), 1);
        assert_eq!(Priority::Low.rank(), 4);
    }

    #[test]
    fn categories_follow_prefixes() {
        assert_eq!(category_for("SECURITE_ACCES_REFUSE"), ActionCategory::Securite);
        assert_eq!(category_for("UTILISATEUR_CREE"), ActionCategory::Utilisateur);
        assert_eq!(category_for("TACHE_ECHOUEE"), ActionCategory::Systeme);
        assert_eq!(category_for("POIDS_AJUSTE"), ActionCategory::Systeme);
        assert_eq!(category_for("NOMINATION_CREEE"), ActionCategory::Metier);
        assert_eq!(category_for(""), ActionCategory::Metier);
    }

    #[test]
    fn weighted_score_is_normalised_and_rounded() {
        let scores = vec![
            WeightedScore::labelled(1.0, 1.0, "a"),
            WeightedScore::labelled(0.0, 2.0, "b"),
        ];
        assert_eq!(weighted_score(&scores), 0.3333);
    }

    #[test]
    fn weighted_score_handles_degenerate_input() {
        assert_eq!(weighted_score(&[]), 0.0);
        let zero = vec![WeightedScore::labelled(0.9, 0.0, "z")];
        assert_eq!(weighted_score(&zero), 0.0);
    }

    #[test]
    fn wire_names_parse_and_serialize() {
        let kind: SignalType = "UTILISATEUR_2FA_ACTIVE".parse().unwrap();
        assert_eq!(kind, SignalType::Utilisateur2faActive);
        assert_eq!(
            serde_json::to_value(SignalType::JoPublication).unwrap(),
            serde_json::json!("JO_PUBLICATION")
        );
        assert!("NOT_A_SIGNAL".parse::<SignalType>().is_err());
        assert_eq!(SignalType::ALL.len(), 50);
    }

    #[test]
    fn endpoints_prefer_cortex_names() {
        assert_eq!(Endpoint::parse("AUDITIF"), Endpoint::Cortex(CortexModule::Auditif));
        assert_eq!(Endpoint::parse("gateway"), Endpoint::Named("gateway".into()));
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }
}
