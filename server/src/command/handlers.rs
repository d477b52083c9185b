//! Commands answered with a single reply and no connection state.

use serde_json::{json, Value};
use wsn_common::{
    sized_chunks, DayQuery, ImageDeleteRequest, ImageSaveRequest, LoginRequest, SignupRequest,
    SlotRequest, SlotsSaveRequest, TokenRequest,
};

use crate::auth::{hash_password, verify_password, AuthUser};
use crate::error::CommandError;
use crate::models::TimeSlot;
use crate::store::StoreError;
use crate::AppState;

pub fn authorize(state: &AppState, token: &str) -> Result<AuthUser, CommandError> {
    Ok(state.tokens.verify(token)?)
}

/// The named slot, which must still exist.
pub fn require_slot(state: &AppState, slot_id: &str) -> Result<TimeSlot, CommandError> {
    state.store.slot(slot_id)?.ok_or(CommandError::InvalidSlot)
}

pub fn signup(state: &AppState, req: SignupRequest) -> Result<Value, CommandError> {
    let rejected = || CommandError::Conflict("Error in Sign Up".to_string());
    let hash = hash_password(&req.password).map_err(|e| {
        tracing::error!("Password hashing failed: {}", e);
        rejected()
    })?;
    match state.store.create_user(&req.email, &req.username, &hash) {
        Ok(user) => {
            tracing::info!(user = %user.email, "User signed up");
            Ok(json!({ "status": 201 }))
        }
        Err(StoreError::Duplicate(_)) => Err(rejected()),
        Err(e) => Err(e.into()),
    }
}

pub fn login(state: &AppState, req: LoginRequest) -> Result<Value, CommandError> {
    let user = state
        .store
        .find_user(&req.email)?
        .filter(|user| verify_password(&req.password, &user.password_hash))
        .ok_or_else(|| CommandError::Unauthorized("User does not exist".to_string()))?;
    let token = state.tokens.issue(&user.email)?;
    Ok(json!({ "token": token, "status": 200 }))
}

pub fn nodes(state: &AppState, req: TokenRequest) -> Result<Value, CommandError> {
    authorize(state, &req.token)?;
    let nodes = state.store.list_nodes()?;
    Ok(json!({ "nodes": nodes, "status": 200 }))
}

pub fn node_types(state: &AppState, req: TokenRequest) -> Result<Value, CommandError> {
    authorize(state, &req.token)?;
    let node_types = state.store.node_types()?;
    Ok(json!({ "nodetypes": node_types, "status": 200 }))
}

pub fn images(state: &AppState, req: TokenRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    let listing = state.images.list(&user.sub)?;
    Ok(json!({ "data": listing, "status": 200 }))
}

pub fn image_save(state: &AppState, req: ImageSaveRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    state
        .images
        .save(&user.sub, &req.nodetype_id, &req.image_name, &req.image_data)?;
    Ok(json!({ "status": 200 }))
}

pub fn image_delete(state: &AppState, req: ImageDeleteRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    if state.images.delete(&user.sub, &req.image_name)? {
        Ok(json!({ "status": 204 }))
    } else {
        Err(CommandError::NotFound(format!("Image {} not found", req.image_name)))
    }
}

pub fn slots_save(state: &AppState, req: SlotsSaveRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    let saved = state.slots.save(&user.sub, req.slots)?;
    let slots: Vec<Value> = saved
        .iter()
        .map(|s| json!({ "start": s.start, "end": s.end }))
        .collect();
    Ok(json!({ "slots": slots, "status": 200 }))
}

pub fn slots_day(state: &AppState, req: DayQuery) -> Result<Value, CommandError> {
    authorize(state, &req.token)?;
    let slots: Vec<Value> = state
        .slots
        .day(req.date)?
        .iter()
        .map(|s| json!({ "start": s.start, "end": s.end, "user_id": s.user_id }))
        .collect();
    Ok(json!({ "slots": slots, "status": 200 }))
}

pub fn slots_user(state: &AppState, req: TokenRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    let slots: Vec<Value> = state
        .slots
        .user_slots(&user.sub)?
        .iter()
        .map(|s| json!({ "slot_id": s.uid, "start": s.start, "end": s.end }))
        .collect();
    Ok(json!({ "slots": slots, "status": 200 }))
}

pub fn clear_log(state: &AppState, req: SlotRequest) -> Result<Value, CommandError> {
    let user = authorize(state, &req.token)?;
    require_slot(state, &req.slot_id)?;
    state.logs.clear(&user.sub, &req.slot_id)?;
    Ok(json!({ "status": 204 }))
}

/// The requester's log for the slot as size-prefixed socket writes.
pub fn read_log(state: &AppState, req: SlotRequest) -> Result<Vec<Vec<u8>>, CommandError> {
    let user = authorize(state, &req.token)?;
    require_slot(state, &req.slot_id)?;
    let data = state
        .logs
        .read(&user.sub, &req.slot_id)?
        .ok_or_else(|| CommandError::NotFound(format!("No log for slot {}", req.slot_id)))?;
    Ok(sized_chunks(&data)?)
}
