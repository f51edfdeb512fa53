//! Request dispatch: control commands first, then `Service.method` handlers

use crate::listeners::ListenerRegistry;
use crate::registry::SessionRegistry;
use crate::service::HandlerResolver;
use crate::session::Session;
use serde_json::Value;
use std::sync::Arc;
use tidewire_proto::command::parse_method_command;
use tidewire_proto::{ControlRequest, ErrorBody, ErrorCode, Request, Response};
use tracing::{debug, error};

/// Turns requests into responses for one server
pub struct Dispatcher {
    resolver: Arc<dyn HandlerResolver>,
    sessions: Arc<SessionRegistry>,
    listeners: Arc<ListenerRegistry>,
    expose_error_details: bool,
}

impl Dispatcher {
    /// Create a dispatcher over the server's registries
    pub fn new(
        resolver: Arc<dyn HandlerResolver>,
        sessions: Arc<SessionRegistry>,
        listeners: Arc<ListenerRegistry>,
        expose_error_details: bool,
    ) -> Self {
        Self {
            resolver,
            sessions,
            listeners,
            expose_error_details,
        }
    }

    /// Handle one request; failures become error responses
    pub async fn dispatch(&self, session: &Session, request: Request) -> Response {
        let Request {
            id, command, params, ..
        } = request;

        match ControlRequest::from_request(&command, &params) {
            Ok(Some(control)) => {
                return match self.control(session, control) {
                    Ok(body) => Response::success(id, body),
                    Err(body) => Response::error(id, body),
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Response::error(id, ErrorBody::new(ErrorCode::BadCommand, e.to_string()))
            }
        }

        let Some((service, method)) = parse_method_command(&command) else {
            return Response::error(
                id,
                ErrorBody::new(ErrorCode::BadCommand, format!("Invalid command: {}", command)),
            );
        };

        let Some(handler) = self.resolver.resolve(service, method) else {
            return Response::error(
                id,
                ErrorBody::new(ErrorCode::NotFound, format!("Method not found: {}", command)),
            );
        };

        match handler.call(session, params).await {
            Ok(body) => Response::success(id, body),
            Err(e) => {
                error!("Handler {} failed for {}: {:#}", command, session.identity(), e);
                let mut body = ErrorBody::new(ErrorCode::InternalError, e.to_string());
                if self.expose_error_details {
                    body = body.with_stack(format!("{:?}", e));
                }
                Response::error(id, body)
            }
        }
    }

    fn control(&self, session: &Session, control: ControlRequest) -> Result<Value, ErrorBody> {
        let body = match control {
            ControlRequest::AddEventListener { event_kind, filter } => {
                let key = self.listeners.register(session, event_kind, filter).ok_or_else(|| {
                    ErrorBody::new(
                        ErrorCode::InternalError,
                        format!("Session of {} is closed", session.identity()),
                    )
                })?;
                Value::String(key.0)
            }
            ControlRequest::RemoveEventListener { key } => {
                if !self.listeners.unregister(session.id(), &key) {
                    debug!("{} removed unknown listener {}", session.identity(), key);
                }
                Value::Null
            }
            ControlRequest::GetEventListenerInfos { event_kind } => {
                let infos = self.listeners.query(&event_kind);
                Value::Array(
                    infos
                        .into_iter()
                        .map(|info| serde_json::json!({ "key": info.key.0, "filter": info.filter }))
                        .collect(),
                )
            }
            ControlRequest::EmitEvent { keys, payload } => {
                let delivered = self.listeners.dispatch(&self.sessions, &keys, &payload);
                debug!(
                    "{} emitted to {}/{} listeners",
                    session.identity(),
                    delivered,
                    keys.len()
                );
                Value::Null
            }
        };
        Ok(body)
    }
}
