//! Point-in-time page markup used for offline generation and validation.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::markup::MarkupExtractor;

static HTML_LANG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<html\b[^>]*\blang\s*=\s*["']?([a-zA-Z]{2,3})(?:[-_][a-zA-Z0-9]+)?"#)
        .expect("valid lang regex")
});

/// Markup captured at one instant. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub markup: String,
    /// Primary language subtag, e.g. `de`
    pub language: Option<String>,
    /// English domain term -> page-language term
    pub translations: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

impl PageSnapshot {
    pub fn new(markup: impl Into<String>) -> Self {
        let markup = markup.into();
        let language = detect_language(&markup);
        let translations = language
            .as_deref()
            .map(domain_terms)
            .unwrap_or_default();
        Self {
            markup,
            language,
            translations,
            captured_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(String::new())
    }

    /// Captures a fresh snapshot, degrading to an empty one if the page
    /// cannot be read.
    pub async fn capture(extractor: &dyn MarkupExtractor, max_chars: usize) -> Self {
        match extractor.extract_truncated(max_chars).await {
            Ok(markup) => {
                debug!(chars = markup.len(), "Captured page snapshot");
                Self::new(markup)
            }
            Err(e) => {
                warn!("Failed to capture page snapshot, continuing without markup: {}", e);
                Self::empty()
            }
        }
    }

    /// Prompt block describing the page language, if it is not English.
    pub fn language_context(&self) -> Option<String> {
        let language = self.language.as_deref()?;
        if language == "en" {
            return None;
        }
        let mut out = format!(
            "The page language is '{language}'. Visible labels are in that language, not English."
        );
        if !self.translations.is_empty() {
            out.push_str("\nCommon terms on this page:");
            for (english, local) in &self.translations {
                out.push_str(&format!("\n- {english} -> {local}"));
            }
        }
        Some(out)
    }
}

/// Primary language subtag from the `<html lang>` attribute.
pub fn detect_language(markup: &str) -> Option<String> {
    HTML_LANG_RE
        .captures(markup)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Built-in UI vocabulary for the languages seen most often on login and
/// checkout flows.
pub fn domain_terms(language: &str) -> BTreeMap<String, String> {
    let table: &[(&str, &str)] = match language {
        "de" => &[
            ("login", "anmelden"),
            ("logout", "abmelden"),
            ("password", "passwort"),
            ("username", "benutzername"),
            ("email", "e-mail"),
            ("submit", "absenden"),
            ("search", "suchen"),
            ("register", "registrieren"),
            ("next", "weiter"),
            ("cart", "warenkorb"),
            ("checkout", "zur kasse"),
        ],
        "fr" => &[
            ("login", "connexion"),
            ("logout", "déconnexion"),
            ("password", "mot de passe"),
            ("username", "nom d'utilisateur"),
            ("email", "e-mail"),
            ("submit", "envoyer"),
            ("search", "rechercher"),
            ("register", "s'inscrire"),
            ("next", "suivant"),
            ("cart", "panier"),
            ("checkout", "commander"),
        ],
        "es" => &[
            ("login", "iniciar sesión"),
            ("logout", "cerrar sesión"),
            ("password", "contraseña"),
            ("username", "usuario"),
            ("email", "correo electrónico"),
            ("submit", "enviar"),
            ("search", "buscar"),
            ("register", "registrarse"),
            ("next", "siguiente"),
            ("cart", "carrito"),
            ("checkout", "pagar"),
        ],
        "it" => &[
            ("login", "accedi"),
            ("logout", "esci"),
            ("password", "password"),
            ("username", "nome utente"),
            ("email", "e-mail"),
            ("submit", "invia"),
            ("search", "cerca"),
            ("register", "registrati"),
            ("next", "avanti"),
            ("cart", "carrello"),
            ("checkout", "cassa"),
        ],
        "nl" => &[
            ("login", "inloggen"),
            ("logout", "uitloggen"),
            ("password", "wachtwoord"),
            ("username", "gebruikersnaam"),
            ("email", "e-mail"),
            ("submit", "verzenden"),
            ("search", "zoeken"),
            ("register", "registreren"),
            ("next", "volgende"),
            ("cart", "winkelwagen"),
            ("checkout", "afrekenen"),
        ],
        "pt" => &[
            ("login", "entrar"),
            ("logout", "sair"),
            ("password", "senha"),
            ("username", "usuário"),
            ("email", "e-mail"),
            ("submit", "enviar"),
            ("search", "pesquisar"),
            ("register", "cadastrar"),
            ("next", "próximo"),
            ("cart", "carrinho"),
            ("checkout", "finalizar compra"),
        ],
        _ => &[],
    };
    table
        .iter()
        .map(|(en, local)| (en.to_string(), local.to_string()))
        .collect()
}
