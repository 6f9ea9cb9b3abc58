use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Who may see a profile attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Everyone,
    Contacts,
    Nobody,
}

impl Visibility {
    /// Whether a non-owner requester may see the attribute.
    pub fn allows(self, is_contact: bool) -> bool {
        match self {
            Visibility::Everyone => true,
            Visibility::Contacts => is_contact,
            Visibility::Nobody => false,
        }
    }
}

// Stored settings treat anything unrecognised as the most restrictive value.
// Client updates go through the strict derive instead.
fn lenient_visibility<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Visibility, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        Some("everyone") => Visibility::Everyone,
        Some("contacts") => Visibility::Contacts,
        _ => Visibility::Nobody,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacySettings {
    #[serde(default, deserialize_with = "lenient_visibility")]
    pub profile_photo: Visibility,
    #[serde(default, deserialize_with = "lenient_visibility")]
    pub about: Visibility,
    #[serde(default, deserialize_with = "lenient_visibility")]
    pub last_seen: Visibility,
    #[serde(default = "default_read_receipts")]
    pub read_receipts: bool,
}

fn default_read_receipts() -> bool {
    true
}

impl Default for PrivacySettings {
    fn default() -> Self {
        PrivacySettings {
            profile_photo: Visibility::Everyone,
            about: Visibility::Everyone,
            last_seen: Visibility::Everyone,
            read_receipts: true,
        }
    }
}

/// Partial privacy update; `None` leaves the current value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyUpdate {
    pub profile_photo: Option<Visibility>,
    pub about: Option<Visibility>,
    pub last_seen: Option<Visibility>,
    pub read_receipts: Option<bool>,
}

impl PrivacySettings {
    pub fn apply(&mut self, update: PrivacyUpdate) {
        if let Some(v) = update.profile_photo {
            self.profile_photo = v;
        }
        if let Some(v) = update.about {
            self.about = v;
        }
        if let Some(v) = update.last_seen {
            self.last_seen = v;
        }
        if let Some(v) = update.read_receipts {
            self.read_receipts = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub privacy_settings: PrivacySettings,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    #[serde(skip)]
    pub socket_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: String) -> Self {
        User {
            username: username.into(),
            display_name: None,
            about: None,
            profile_picture: None,
            is_online: false,
            last_seen: None,
            privacy_settings: PrivacySettings::default(),
            phone_number: None,
            email: None,
            password_hash,
            socket_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Profile fields a user may change about themself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub profile_picture: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

impl User {
    pub fn apply_profile(&mut self, update: ProfileUpdate) {
        if update.display_name.is_some() {
            self.display_name = update.display_name;
        }
        if update.about.is_some() {
            self.about = update.about;
        }
        if update.profile_picture.is_some() {
            self.profile_picture = update.profile_picture;
        }
        if update.phone_number.is_some() {
            self.phone_number = update.phone_number;
        }
        if update.email.is_some() {
            self.email = update.email;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub username: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub text: Option<String>,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from_username: String,
    pub to_username: String,
    pub text: Option<String>,
    pub file_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub starred_by: BTreeSet<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edit_history: Vec<EditRecord>,
    #[serde(default)]
    pub pinned: bool,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        text: Option<String>,
        file_url: Option<String>,
    ) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            from_username: from.into(),
            to_username: to.into(),
            text,
            file_url,
            timestamp: Utc::now(),
            read: false,
            starred_by: BTreeSet::new(),
            reactions: Vec::new(),
            edited: false,
            edit_history: Vec::new(),
            pinned: false,
        }
    }

    pub fn involves(&self, username: &str) -> bool {
        self.from_username == username || self.to_username == username
    }

    /// The other side of the conversation as seen from `username`.
    pub fn partner_of(&self, username: &str) -> &str {
        if self.from_username == username {
            &self.to_username
        } else {
            &self.from_username
        }
    }

    /// One reaction per user; an empty emoji clears it.
    pub fn set_reaction(&mut self, username: &str, emoji: &str) {
        self.reactions.retain(|r| r.username != username);
        if !emoji.is_empty() {
            self.reactions.push(Reaction {
                username: username.to_string(),
                emoji: emoji.to_string(),
            });
        }
    }

    pub fn edit_text(&mut self, text: String) {
        self.edit_history.push(EditRecord {
            text: self.text.take(),
            edited_at: Utc::now(),
        });
        self.text = Some(text);
        self.edited = true;
    }
}
