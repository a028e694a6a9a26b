//! Outbound mail boundary. Rendering and delivery belong to the mail collaborator;
//! this module only decides subject, link and template name.

use async_trait::async_trait;
use tracing::info;

/// Language requested by the client through `?language=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Ru,
    Es,
    Ke,
}

impl Locale {
    /// Unknown or missing tags fall back to English.
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(|t| t.trim().to_ascii_lowercase()).as_deref() {
            Some("ru") => Locale::Ru,
            Some("es") => Locale::Es,
            Some("ke") => Locale::Ke,
            _ => Locale::En,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Ru => "ru",
            Locale::Es => "es",
            Locale::Ke => "ke",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    VerificationCode,
    ResetPassword,
}

impl EmailTemplate {
    pub fn name(self) -> &'static str {
        match self {
            EmailTemplate::VerificationCode => "verificationCode",
            EmailTemplate::ResetPassword => "resetPassword",
        }
    }

    pub fn subject(self, locale: Locale, brand: &str) -> String {
        match (self, locale) {
            (EmailTemplate::VerificationCode, Locale::En) => format!("{brand} account activation"),
            (EmailTemplate::VerificationCode, Locale::Ru) => format!("{brand} активация аккаунта"),
            (EmailTemplate::VerificationCode, Locale::Es) => {
                format!("{brand} activación de cuenta")
            }
            (EmailTemplate::VerificationCode, Locale::Ke) => {
                format!("{brand} ანგარიშის გააქტიურება")
            }
            (EmailTemplate::ResetPassword, Locale::En) => {
                "Password reset request (available for 15 minutes)".into()
            }
            (EmailTemplate::ResetPassword, Locale::Ru) => {
                "Запрос на сброс пароля (доступно 15 мин)".into()
            }
            (EmailTemplate::ResetPassword, Locale::Es) => {
                "Solicitud de restablecimiento de contraseña (15 min disponibles)".into()
            }
            (EmailTemplate::ResetPassword, Locale::Ke) => {
                "პაროლის გადატვირთვის მოთხოვნა (ხელმისაწვდომია 15 წთ)".into()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailData {
    pub url: String,
    pub first_name: String,
    pub subject: String,
}

impl EmailData {
    pub fn new(
        template: EmailTemplate,
        locale: Locale,
        brand: &str,
        url: String,
        full_name: &str,
    ) -> Self {
        Self {
            url,
            first_name: first_name(full_name).to_string(),
            subject: template.subject(locale, brand),
        }
    }
}

/// Names are stored as "Surname Given"; the greeting uses the second word.
pub fn first_name(full_name: &str) -> &str {
    let mut words = full_name.split_whitespace();
    let first = words.next().unwrap_or("");
    words.next().unwrap_or(first)
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        data: &EmailData,
        template: EmailTemplate,
        locale: Locale,
    ) -> anyhow::Result<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        to: &str,
        data: &EmailData,
        template: EmailTemplate,
        locale: Locale,
    ) -> anyhow::Result<()> {
        info!(
            %to,
            template = template.name(),
            locale = locale.tag(),
            subject = %data.subject,
            url = %data.url,
            "email queued"
        );
        Ok(())
    }
}
