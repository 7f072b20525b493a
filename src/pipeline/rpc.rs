//! Runtime RPC handler.

use std::sync::Arc;

use arena_proto::{Envelope, Payload};

use super::Pipeline;
use crate::error::{ApiError, ApiResult};
use crate::runtime::CallContext;
use crate::session::SessionHandle;

pub(super) fn call(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    id: &str,
    payload: &str,
) -> ApiResult<Option<Envelope>> {
    if id.is_empty() {
        return Err(ApiError::InvalidArgument("rpc id is required".to_string()));
    }
    let ctx = CallContext::from_session(session);
    let result = p.nexus().runtime.rpc(&ctx, id, payload)?;
    Ok(Some(Envelope::new(
        cid,
        Payload::Rpc {
            id: id.to_string(),
            payload: result,
        },
    )))
}
