//! Redacted views of a user's profile.
//!
//! [`filter_user`] applies the owner's privacy settings for a given requester;
//! [`public_profile`] and [`list_entry`] project the result into the two
//! response shapes the API hands out. Phone number and email only ever reach
//! the profile owner.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{PrivacySettings, User};

/// A user record as one particular requester is allowed to see it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredUser {
    pub username: String,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub profile_picture: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub is_contact: bool,
    pub privacy_settings: Option<PrivacySettings>,
}

/// Filters `target` for `requester`, given the target's contact set.
pub fn filter_user(requester: &str, target: &User, contacts: &BTreeSet<String>) -> FilteredUser {
    redact(requester, target, contacts.contains(requester))
}

/// Same as [`filter_user`] but takes the requester's contact set, so list
/// endpoints resolve contacts once per request. Contact is symmetric, so
/// `target` being in the requester's set is the same test.
pub fn filter_for_requester(
    requester: &str,
    target: &User,
    requester_contacts: &BTreeSet<String>,
) -> FilteredUser {
    redact(requester, target, requester_contacts.contains(&target.username))
}

fn redact(requester: &str, target: &User, is_contact: bool) -> FilteredUser {
    if requester == target.username {
        return FilteredUser {
            username: target.username.clone(),
            display_name: target.display_name.clone(),
            about: target.about.clone(),
            profile_picture: target.profile_picture.clone(),
            is_online: target.is_online,
            last_seen: target.last_seen,
            phone_number: target.phone_number.clone(),
            email: target.email.clone(),
            is_contact: false,
            privacy_settings: Some(target.privacy_settings.clone()),
        };
    }

    let settings = &target.privacy_settings;
    let photo = settings.profile_photo.allows(is_contact);
    let about = settings.about.allows(is_contact);
    let last_seen = settings.last_seen.allows(is_contact);

    FilteredUser {
        username: target.username.clone(),
        display_name: target.display_name.clone(),
        about: target.about.clone().filter(|_| about),
        profile_picture: target.profile_picture.clone().filter(|_| photo),
        is_online: last_seen && target.is_online,
        last_seen: target.last_seen.filter(|_| last_seen),
        phone_number: None,
        email: None,
        is_contact,
        privacy_settings: None,
    }
}

/// Whether `requester` may see the target's presence at all.
pub fn can_see_presence(requester: &str, target: &User, contacts: &BTreeSet<String>) -> bool {
    requester == target.username
        || target
            .privacy_settings
            .last_seen
            .allows(contacts.contains(requester))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub username: String,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub profile_picture: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub is_contact: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_settings: Option<PrivacySettings>,
}

pub fn public_profile(filtered: FilteredUser) -> PublicProfile {
    PublicProfile {
        username: filtered.username,
        display_name: filtered.display_name,
        about: filtered.about,
        profile_picture: filtered.profile_picture,
        is_online: filtered.is_online,
        last_seen: filtered.last_seen,
        phone_number: filtered.phone_number,
        email: filtered.email,
        is_contact: filtered.is_contact,
        privacy_settings: filtered.privacy_settings,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListEntry {
    pub username: String,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub profile_picture: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

pub fn list_entry(filtered: FilteredUser) -> UserListEntry {
    UserListEntry {
        username: filtered.username,
        display_name: filtered.display_name,
        about: filtered.about,
        profile_picture: filtered.profile_picture,
        is_online: filtered.is_online,
        last_seen: filtered.last_seen,
    }
}
