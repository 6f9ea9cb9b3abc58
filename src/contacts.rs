use std::collections::BTreeSet;

use log::debug;

use crate::store::ChatStore;

/// Usernames `username` has exchanged at least one message with, in either
/// direction. Never contains `username` itself.
pub async fn resolve_contacts(store: &dyn ChatStore, username: &str) -> BTreeSet<String> {
    let mut contacts = store.distinct_recipients(username).await;
    contacts.extend(store.distinct_senders(username).await);
    contacts.remove(username);
    debug!("{} has {} contacts", username, contacts.len());
    contacts
}
