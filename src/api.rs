use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;

use log::info;
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::{self, bearer_token, LoginRequest, RegisterRequest, Sessions};
use crate::chat::{self, SendMessageRequest};
use crate::contacts::resolve_contacts;
use crate::error::ApiError;
use crate::events::ServerEvent;
use crate::models::{PrivacyUpdate, ProfileUpdate, User};
use crate::privacy::{
    filter_for_requester, filter_user, list_entry, public_profile, PublicProfile, UserListEntry,
};
use crate::socket::SocketHub;
use crate::store::{ChatStore, Store};

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: Sessions,
    pub hub: SocketHub,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        AppState {
            hub: SocketHub::new(store.clone()),
            sessions: Sessions::new(),
            store,
        }
    }
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: PublicProfile,
}

#[derive(Deserialize)]
struct ReactRequest {
    emoji: String,
}

#[derive(Deserialize)]
struct EditRequest {
    text: String,
}

#[derive(Serialize)]
struct ReadResponse {
    updated: usize,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let register = warp::path!("api" / "register")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(register_handler);

    let login = warp::path!("api" / "login")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(login_handler);

    let logout = warp::path!("api" / "logout")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_state(state.clone()))
        .and_then(logout_handler);

    let users = warp::path!("api" / "users")
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(contacts_handler);

    let all_users = warp::path!("api" / "all-users")
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(all_users_handler);

    let recent_chats = warp::path!("api" / "recent-chats")
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(recent_chats_handler);

    let public_profile = warp::path!("api" / "user-public-profile" / String)
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(public_profile_handler);

    let me = warp::path!("api" / "me")
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(me_handler);

    let update_profile = warp::path!("api" / "profile")
        .and(warp::put())
        .and(with_user(state.clone()))
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(update_profile_handler);

    let update_privacy = warp::path!("api" / "privacy-settings")
        .and(warp::put())
        .and(with_user(state.clone()))
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(update_privacy_handler);

    let send = warp::path!("api" / "messages")
        .and(warp::post())
        .and(with_user(state.clone()))
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(send_handler);

    let conversation = warp::path!("api" / "messages" / String)
        .and(warp::get())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(conversation_handler);

    let mark_read = warp::path!("api" / "messages" / String / "read")
        .and(warp::post())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(mark_read_handler);

    let star = warp::path!("api" / "messages" / "id" / String / "star")
        .and(warp::post())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(star_handler);

    let react = warp::path!("api" / "messages" / "id" / String / "react")
        .and(warp::post())
        .and(with_user(state.clone()))
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(react_handler);

    let edit = warp::path!("api" / "messages" / "id" / String)
        .and(warp::put())
        .and(with_user(state.clone()))
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(edit_handler);

    let pin = warp::path!("api" / "messages" / "id" / String / "pin")
        .and(warp::post())
        .and(with_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(pin_handler);

    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state))
        .and_then(ws_handler);

    register
        .or(login)
        .or(logout)
        .or(users)
        .or(all_users)
        .or(recent_chats)
        .or(public_profile)
        .or(me)
        .or(update_profile)
        .or(update_privacy)
        .or(send)
        .or(conversation)
        .or(mark_read)
        .or(star)
        .or(react)
        .or(edit)
        .or(pin)
        .or(ws)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Resolves the bearer token to a username or rejects with 401.
fn with_user(state: AppState) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: AppState| async move {
            let token = header
                .as_deref()
                .and_then(bearer_token)
                .ok_or(ApiError::Unauthorized)?;
            state
                .sessions
                .resolve(token)
                .await
                .ok_or_else(|| Rejection::from(ApiError::Unauthorized))
        })
}

async fn current_user(store: &dyn ChatStore, username: &str) -> Result<User, ApiError> {
    store.find_user(username).await.ok_or(ApiError::Unauthorized)
}

fn self_profile(user: &User) -> PublicProfile {
    public_profile(filter_user(&user.username, user, &BTreeSet::new()))
}

async fn register_handler(req: RegisterRequest, state: AppState) -> Result<impl Reply, Rejection> {
    let user = auth::register(state.store.as_ref(), req).await?;
    Ok(warp::reply::with_status(
        warp::reply::json(&self_profile(&user)),
        StatusCode::CREATED,
    ))
}

async fn login_handler(req: LoginRequest, state: AppState) -> Result<impl Reply, Rejection> {
    let (token, user) = auth::login(state.store.as_ref(), &state.sessions, req).await?;
    Ok(warp::reply::json(&LoginResponse {
        token,
        user: self_profile(&user),
    }))
}

async fn logout_handler(header: Option<String>, state: AppState) -> Result<impl Reply, Rejection> {
    let token = header
        .as_deref()
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;
    if !state.sessions.revoke(token).await {
        return Err(ApiError::Unauthorized.into());
    }
    Ok(warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT))
}

async fn contacts_handler(me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let contacts = resolve_contacts(store, &me).await;
    let mut entries: Vec<UserListEntry> = Vec::with_capacity(contacts.len());
    for username in &contacts {
        if let Some(user) = store.find_user(username).await {
            entries.push(list_entry(filter_for_requester(&me, &user, &contacts)));
        }
    }
    Ok(warp::reply::json(&entries))
}

async fn all_users_handler(me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let contacts = resolve_contacts(store, &me).await;
    let entries: Vec<UserListEntry> = store
        .list_users()
        .await
        .iter()
        .filter(|u| u.username != me)
        .map(|u| list_entry(filter_for_requester(&me, u, &contacts)))
        .collect();
    Ok(warp::reply::json(&entries))
}

async fn recent_chats_handler(me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let chats = chat::recent_chats(state.store.as_ref(), &me).await;
    Ok(warp::reply::json(&chats))
}

async fn public_profile_handler(
    username: String,
    me: String,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let target = store
        .find_user(&username)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("User '{username}' not found")))?;
    let contacts = resolve_contacts(store, &target.username).await;
    Ok(warp::reply::json(&public_profile(filter_user(
        &me, &target, &contacts,
    ))))
}

async fn me_handler(me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let user = current_user(state.store.as_ref(), &me).await?;
    Ok(warp::reply::json(&self_profile(&user)))
}

async fn update_profile_handler(
    me: String,
    update: ProfileUpdate,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let user = state
        .store
        .update_user(&me, Box::new(move |u| u.apply_profile(update)))
        .await
        .map_err(ApiError::from)?;
    info!("{} updated their profile", me);
    Ok(warp::reply::json(&self_profile(&user)))
}

async fn update_privacy_handler(
    me: String,
    update: PrivacyUpdate,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let user = state
        .store
        .update_user(&me, Box::new(move |u| u.privacy_settings.apply(update)))
        .await
        .map_err(ApiError::from)?;
    info!("{} updated privacy settings", me);
    Ok(warp::reply::json(&self_profile(&user)))
}

async fn send_handler(
    me: String,
    req: SendMessageRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let message = chat::send_message(state.store.as_ref(), &me, req).await?;
    state
        .hub
        .notify_user(
            &message.to_username,
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;
    Ok(warp::reply::with_status(
        warp::reply::json(&message),
        StatusCode::CREATED,
    ))
}

async fn conversation_handler(
    partner: String,
    me: String,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let messages = chat::conversation(state.store.as_ref(), &me, &partner).await?;
    Ok(warp::reply::json(&messages))
}

async fn mark_read_handler(
    partner: String,
    me: String,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let (updated, notify) = chat::mark_read(state.store.as_ref(), &me, &partner).await?;
    if updated > 0 && notify {
        state
            .hub
            .notify_user(&partner, &ServerEvent::MessagesRead { by: me })
            .await;
    }
    Ok(warp::reply::json(&ReadResponse { updated }))
}

async fn star_handler(id: String, me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let message = chat::toggle_star(store, &me, &id).await?;
    Ok(warp::reply::json(&chat::present(store, &me, message).await))
}

async fn react_handler(
    id: String,
    me: String,
    req: ReactRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let message = chat::react(store, &me, &id, &req.emoji).await?;
    Ok(warp::reply::json(&chat::present(store, &me, message).await))
}

async fn edit_handler(
    id: String,
    me: String,
    req: EditRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let message = chat::edit(store, &me, &id, req.text).await?;
    Ok(warp::reply::json(&chat::present(store, &me, message).await))
}

async fn pin_handler(id: String, me: String, state: AppState) -> Result<impl Reply, Rejection> {
    let store = state.store.as_ref();
    let message = chat::toggle_pin(store, &me, &id).await?;
    Ok(warp::reply::json(&chat::present(store, &me, message).await))
}

async fn ws_handler(
    ws: warp::ws::Ws,
    query: HashMap<String, String>,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let token = query.get("token").ok_or(ApiError::Unauthorized)?;
    let username = state
        .sessions
        .resolve(token)
        .await
        .ok_or(ApiError::Unauthorized)?;
    Ok(ws.on_upgrade(move |socket| async move {
        state.hub.handle_connection(socket, username).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::handle_rejection;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn app() -> AppState {
        AppState::new(MemoryStore::shared())
    }

    fn filter(state: &AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        routes(state.clone()).recover(handle_rejection)
    }

    async fn signup(state: &AppState, username: &str) -> String {
        let filter = filter(state);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/register")
            .json(&json!({
                "username": username,
                "password": "secret1",
                "email": format!("{username}@example.com"),
                "phoneNumber": "+15550000",
            }))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/login")
            .json(&json!({ "username": username, "password": "secret1" }))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn call(
        state: &AppState,
        method: &str,
        path: &str,
        token: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = warp::test::request()
            .method(method)
            .path(path)
            .header("authorization", format!("Bearer {token}"));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.reply(&filter(state)).await;
        let value = if resp.body().is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(resp.body()).unwrap()
        };
        (resp.status(), value)
    }

    /// Leaves `username` online with a recorded last-seen time.
    async fn bring_online(state: &AppState, username: &str) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = state.hub.attach(username, tx).await;
        state.hub.detach(&first).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        state.hub.attach(username, tx).await;
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected() {
        let state = app();
        let resp = warp::test::request()
            .path("/api/users")
            .reply(&filter(&state))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (status, body) = call(&state, "GET", "/api/all-users", "bogus", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn public_profile_hides_private_fields_from_others() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        let (status, body) = call(&state, "GET", "/api/user-public-profile/alice", &bob, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["phoneNumber"].is_null());
        assert!(body["email"].is_null());
        assert_eq!(body["isContact"], false);

        let (_, body) = call(&state, "GET", "/api/user-public-profile/alice", &alice, None).await;
        assert_eq!(body["email"], "alice@example.com");
        assert_eq!(body["phoneNumber"], "+15550000");

        let (status, _) = call(&state, "GET", "/api/user-public-profile/nobody", &alice, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn contacts_only_about_follows_message_history() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;
        let carol = signup(&state, "carol").await;

        call(&state, "PUT", "/api/profile", &alice, Some(json!({ "about": "at work" }))).await;
        let (status, _) = call(
            &state,
            "PUT",
            "/api/privacy-settings",
            &alice,
            Some(json!({ "about": "contacts" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &state,
            "POST",
            "/api/messages",
            &bob,
            Some(json!({ "to": "alice", "text": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&state, "GET", "/api/user-public-profile/alice", &bob, None).await;
        assert_eq!(body["about"], "at work");
        assert_eq!(body["isContact"], true);
        let (_, body) = call(&state, "GET", "/api/user-public-profile/alice", &carol, None).await;
        assert!(body["about"].is_null());

        let (_, contacts) = call(&state, "GET", "/api/users", &alice, None).await;
        assert_eq!(contacts.as_array().unwrap().len(), 1);
        assert_eq!(contacts[0]["username"], "bob");
        assert!(contacts[0].get("email").is_none());

        let (_, everyone) = call(&state, "GET", "/api/all-users", &carol, None).await;
        let names: Vec<&str> = everyone
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(everyone[0]["about"].is_null());
    }

    #[tokio::test]
    async fn recent_chats_and_conversation() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        call(&state, "POST", "/api/messages", &alice, Some(json!({ "to": "bob", "text": "one" }))).await;
        call(&state, "POST", "/api/messages", &alice, Some(json!({ "to": "bob", "text": "two" }))).await;

        let (_, chats) = call(&state, "GET", "/api/recent-chats", &bob, None).await;
        assert_eq!(chats[0]["user"]["username"], "alice");
        assert_eq!(chats[0]["unreadCount"], 2);
        assert_eq!(chats[0]["lastMessage"]["text"], "two");

        let (_, read) = call(&state, "POST", "/api/messages/alice/read", &bob, None).await;
        assert_eq!(read["updated"], 2);

        let (_, convo) = call(&state, "GET", "/api/messages/bob", &alice, None).await;
        assert_eq!(convo.as_array().unwrap().len(), 2);
        assert_eq!(convo[0]["read"], true);

        let id = convo[0]["id"].as_str().unwrap().to_string();
        let (status, edited) = call(
            &state,
            "PUT",
            &format!("/api/messages/id/{id}"),
            &alice,
            Some(json!({ "text": "uno" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["edited"], true);
        assert_eq!(edited["editHistory"][0]["text"], "one");

        let (status, _) = call(
            &state,
            "PUT",
            &format!("/api/messages/id/{id}"),
            &bob,
            Some(json!({ "text": "hijack" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn logout_revokes_token() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let (status, _) = call(&state, "POST", "/api/logout", &alice, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, "GET", "/api/me", &alice, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_privacy_value_is_rejected() {
        let state = app();
        let alice = signup(&state, "alice").await;

        let (status, body) = call(
            &state,
            "PUT",
            "/api/privacy-settings",
            &alice,
            Some(json!({ "about": "Contacts" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));

        let (_, me) = call(&state, "GET", "/api/me", &alice, None).await;
        assert_eq!(me["privacySettings"]["about"], "everyone");
    }

    #[tokio::test]
    async fn all_users_masks_presence_for_non_contacts() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;
        let carol = signup(&state, "carol").await;

        call(
            &state,
            "PUT",
            "/api/privacy-settings",
            &alice,
            Some(json!({ "lastSeen": "contacts" })),
        )
        .await;
        call(&state, "POST", "/api/messages", &bob, Some(json!({ "to": "alice", "text": "hi" }))).await;
        bring_online(&state, "alice").await;

        let (_, seen_by_carol) = call(&state, "GET", "/api/all-users", &carol, None).await;
        assert_eq!(seen_by_carol[0]["username"], "alice");
        assert_eq!(seen_by_carol[0]["isOnline"], false);
        assert!(seen_by_carol[0]["lastSeen"].is_null());

        let (_, seen_by_bob) = call(&state, "GET", "/api/all-users", &bob, None).await;
        assert_eq!(seen_by_bob[0]["username"], "alice");
        assert_eq!(seen_by_bob[0]["isOnline"], true);
        assert!(seen_by_bob[0]["lastSeen"].is_string());
    }

    #[tokio::test]
    async fn recent_chats_apply_last_seen_setting() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        call(
            &state,
            "PUT",
            "/api/privacy-settings",
            &alice,
            Some(json!({ "lastSeen": "contacts" })),
        )
        .await;
        call(&state, "POST", "/api/messages", &alice, Some(json!({ "to": "bob", "text": "hi" }))).await;
        bring_online(&state, "alice").await;

        let (_, chats) = call(&state, "GET", "/api/recent-chats", &bob, None).await;
        assert_eq!(chats[0]["user"]["username"], "alice");
        assert_eq!(chats[0]["user"]["isOnline"], true);
        assert!(chats[0]["user"]["lastSeen"].is_string());

        call(
            &state,
            "PUT",
            "/api/privacy-settings",
            &alice,
            Some(json!({ "lastSeen": "nobody" })),
        )
        .await;
        let (_, chats) = call(&state, "GET", "/api/recent-chats", &bob, None).await;
        assert_eq!(chats[0]["user"]["isOnline"], false);
        assert!(chats[0]["user"]["lastSeen"].is_null());

        // presence writes after the privacy change leave it in place
        bring_online(&state, "alice").await;
        let (_, me) = call(&state, "GET", "/api/me", &alice, None).await;
        assert_eq!(me["privacySettings"]["lastSeen"], "nobody");
        assert_eq!(me["isOnline"], true);
    }

    #[tokio::test]
    async fn mark_read_from_unknown_user_is_not_found() {
        let state = app();
        let alice = signup(&state, "alice").await;
        let (status, body) = call(&state, "POST", "/api/messages/nobody/read", &alice, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "User 'nobody' not found");
    }
}
