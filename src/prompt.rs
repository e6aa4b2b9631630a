//! Classification of `ssh(1)`'s askpass prompt text into a structured
//! [`AskpassPrompt`], grounded in
//! `examples/original_source/src/ferny/ssh_askpass.py`.

use once_cell::sync::Lazy;
use regex::Regex;

/// A prompt `ssh` asked the askpass helper to relay, already split into its
/// last line (the actual question) and whatever context preceded it.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    /// stderr accumulated before the askpass helper was invoked at all.
    pub stderr: String,
    /// All lines of the prompt text except the last.
    pub messages: String,
    /// The last line of the prompt text: the actual question.
    pub prompt: String,
}

/// The structured form of a classified askpass prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum AskpassPrompt {
    Password { ctx: PromptContext, username: Option<String>, hostname: Option<String> },
    Passphrase { ctx: PromptContext, filename: String },
    FidoPin { ctx: PromptContext, algorithm: String, filename: String },
    FidoUserPresence { ctx: PromptContext, algorithm: String, fingerprint: String },
    Pkcs11Pin { ctx: PromptContext, pkcs11_id: String },
    HostKey { ctx: PromptContext, algorithm: Option<String>, fingerprint: Option<String> },
    /// Didn't match any of the known patterns.
    Generic { ctx: PromptContext },
}

impl AskpassPrompt {
    pub fn ctx(&self) -> &PromptContext {
        match self {
            AskpassPrompt::Password { ctx, .. }
            | AskpassPrompt::Passphrase { ctx, .. }
            | AskpassPrompt::FidoPin { ctx, .. }
            | AskpassPrompt::FidoUserPresence { ctx, .. }
            | AskpassPrompt::Pkcs11Pin { ctx, .. }
            | AskpassPrompt::HostKey { ctx, .. }
            | AskpassPrompt::Generic { ctx } => ctx,
        }
    }

    /// Whether any answer at all is accepted for this prompt kind.
    ///
    /// `FidoUserPresence` is a touch-your-token notification: ssh never
    /// reads a reply for it.
    pub fn accepts_answer(&self) -> bool {
        !matches!(self, AskpassPrompt::FidoUserPresence { .. })
    }
}

const USERNAME: &str = r"(?P<username>[^ @']+)";
const HOSTNAME: &str = r"(?P<hostname>[^ @']+)";
const FILENAME: &str = r"(?P<filename>.+)";
const ALGORITHM: &str = r"(?P<algorithm>\b[-\w]+\b)";
const FINGERPRINT: &str = r"(?P<fingerprint>SHA256:[0-9A-Za-z+/]{43})";
const PKCS11_ID: &str = r"(?P<pkcs11_id>.+)";

fn full_match<'t>(re: &Regex, s: &'t str) -> Option<regex::Captures<'t>> {
    let caps = re.captures(s)?;
    let m = caps.get(0).unwrap();
    (m.start() == 0 && m.end() == s.len()).then_some(caps)
}

static PASSWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{USERNAME}@{HOSTNAME}'s password: $")).unwrap());

static PASSPHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^Enter passphrase for key '{FILENAME}': $")).unwrap());

static FIDO_PIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^Enter PIN for {ALGORITHM} key {FILENAME}: $")).unwrap());

static FIDO_PRESENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^Confirm user presence for key {ALGORITHM} {FINGERPRINT}$")).unwrap());

static PKCS11_RE: Lazy<Regex> = Lazy::new(|| Regex::new(&format!("^Enter PIN for '{PKCS11_ID}': $")).unwrap());

static HOST_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Are you sure you want to continue connecting \(yes/no(/\[fingerprint\])?\)\? $").unwrap());

static HOST_KEY_EXTRA_FINGERPRINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?m){FINGERPRINT}[.]$")).unwrap());
static HOST_KEY_EXTRA_ALGORITHM_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?m)^{ALGORITHM} key fingerprint is")).unwrap());
static HOST_KEY_EXTRA_SENT_BY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        "(?m)^The fingerprint for the {ALGORITHM} key sent by the remote host is$"
    ))
    .unwrap()
});

/// Split `text` into `(messages, last_line)` the way the upstream classifier
/// does: the last line is everything after the second-to-last newline,
/// excluding an optional final newline character.
fn split_last_line(text: &str) -> (&str, &str) {
    let trimmed_end = text.strip_suffix('\n').unwrap_or(text);
    match trimmed_end.rfind('\n') {
        Some(idx) => (&text[..idx + 1], &text[idx + 1..]),
        None => ("", text),
    }
}

/// Classify a prompt given the text ssh handed to the askpass helper and
/// whatever stderr had already accumulated, in the tie-break order FIDO PIN
/// → FIDO presence → HostKey → PKCS#11 PIN → Passphrase → Password → generic.
pub fn categorize_ssh_prompt(text: &str, stderr: &str) -> AskpassPrompt {
    let (messages, last_line) = split_last_line(text);
    let ctx = PromptContext {
        stderr: stderr.to_owned(),
        messages: messages.to_owned(),
        prompt: last_line.to_owned(),
    };

    if let Some(caps) = full_match(&FIDO_PIN_RE, last_line) {
        return AskpassPrompt::FidoPin {
            ctx,
            algorithm: caps["algorithm"].to_owned(),
            filename: caps["filename"].to_owned(),
        };
    }

    if let Some(caps) = full_match(&FIDO_PRESENCE_RE, last_line) {
        return AskpassPrompt::FidoUserPresence {
            ctx,
            algorithm: caps["algorithm"].to_owned(),
            fingerprint: caps["fingerprint"].to_owned(),
        };
    }

    if full_match(&HOST_KEY_RE, last_line).is_some() {
        let algorithm = HOST_KEY_EXTRA_ALGORITHM_LINE_RE
            .captures(messages)
            .or_else(|| HOST_KEY_EXTRA_SENT_BY_RE.captures(messages))
            .map(|c| c["algorithm"].to_owned());
        let fingerprint = HOST_KEY_EXTRA_FINGERPRINT_RE
            .captures(messages)
            .map(|c| c["fingerprint"].to_owned());
        return AskpassPrompt::HostKey { ctx, algorithm, fingerprint };
    }

    if let Some(caps) = full_match(&PKCS11_RE, last_line) {
        return AskpassPrompt::Pkcs11Pin { ctx, pkcs11_id: caps["pkcs11_id"].to_owned() };
    }

    if let Some(caps) = full_match(&PASSPHRASE_RE, last_line) {
        return AskpassPrompt::Passphrase { ctx, filename: caps["filename"].to_owned() };
    }

    if let Some(caps) = full_match(&PASSWORD_RE, last_line) {
        return AskpassPrompt::Password {
            ctx,
            username: caps.name("username").map(|m| m.as_str().to_owned()),
            hostname: caps.name("hostname").map(|m| m.as_str().to_owned()),
        };
    }

    AskpassPrompt::Generic { ctx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_password_prompt() {
        let prompt = categorize_ssh_prompt("alice@example.com's password: ", "");
        assert!(matches!(
            prompt,
            AskpassPrompt::Password { username: Some(u), hostname: Some(h), .. }
                if u == "alice" && h == "example.com"
        ));
    }

    #[test]
    fn classifies_passphrase_prompt() {
        let prompt = categorize_ssh_prompt("Enter passphrase for key '/home/alice/.ssh/id_ed25519': ", "");
        assert!(matches!(prompt, AskpassPrompt::Passphrase { filename, .. } if filename == "/home/alice/.ssh/id_ed25519"));
    }

    #[test]
    fn classifies_fido_presence_before_hostkey() {
        let prompt = categorize_ssh_prompt(
            "Confirm user presence for key ecdsa-sk SHA256:wL3oFrKq4PNY3V4jQPE7vJ5CmA2CvBg7l7zb+jLoOVo",
            "",
        );
        assert!(matches!(prompt, AskpassPrompt::FidoUserPresence { ref algorithm, .. } if algorithm == "ecdsa-sk"));
        assert!(!prompt.accepts_answer());
    }

    #[test]
    fn classifies_host_key_with_extras() {
        let text = "ED25519 key fingerprint is SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU.\nAre you sure you want to continue connecting (yes/no/[fingerprint])? ";
        let prompt = categorize_ssh_prompt(text, "");
        match prompt {
            AskpassPrompt::HostKey { algorithm, fingerprint, .. } => {
                assert_eq!(algorithm.as_deref(), Some("ED25519"));
                assert_eq!(fingerprint.as_deref(), Some("SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_text_is_generic() {
        let prompt = categorize_ssh_prompt("some unexpected prompt", "warn\n");
        assert!(matches!(prompt, AskpassPrompt::Generic { .. }));
    }
}
