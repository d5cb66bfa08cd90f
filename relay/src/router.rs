//! Route resolution: maps (method, path) to an endpoint. Authorization is
//! applied by the service layer according to each endpoint's credential kind.

use hyper::Method;

/// Which credential map an evaluation endpoint authorizes against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthKind {
    Server,
    Mobile,
}

#[derive(Debug, PartialEq)]
pub enum Endpoint {
    /// `GET /status`
    Status,
    /// `GET /flags`: SSE subscription for a server credential.
    Stream,
    /// `POST /bulk`: analytics event passthrough.
    BulkEvents,
    /// `GET /sdk/eval/users/{user}` and `GET /msdk/eval/users/{user}`.
    EvalUserPath { kind: AuthKind, user: String },
    /// `REPORT /sdk/eval/user` and `REPORT /msdk/eval/user`.
    EvalUserBody { kind: AuthKind },
    /// `GET /sdk/eval/{envId}/users/{user}`.
    BrowserEvalUserPath { env_id: String, user: String },
    /// `REPORT /sdk/eval/{envId}/user`.
    BrowserEvalUserBody { env_id: String },
    /// `GET /sdk/goals/{envId}`.
    Goals { env_id: String },
}

pub fn resolve(method: &Method, path: &str) -> Option<Endpoint> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["status"]) => Some(Endpoint::Status),
        ("GET", ["flags"]) => Some(Endpoint::Stream),
        ("POST", ["bulk"]) => Some(Endpoint::BulkEvents),

        ("GET", ["sdk", "eval", "users", user]) => Some(Endpoint::EvalUserPath {
            kind: AuthKind::Server,
            user: user.to_string(),
        }),
        ("REPORT", ["sdk", "eval", "user"]) => Some(Endpoint::EvalUserBody {
            kind: AuthKind::Server,
        }),

        ("GET", ["msdk", "eval", "users", user]) => Some(Endpoint::EvalUserPath {
            kind: AuthKind::Mobile,
            user: user.to_string(),
        }),
        ("REPORT", ["msdk", "eval", "user"]) => Some(Endpoint::EvalUserBody {
            kind: AuthKind::Mobile,
        }),

        ("GET", ["sdk", "eval", env_id, "users", user]) => Some(Endpoint::BrowserEvalUserPath {
            env_id: env_id.to_string(),
            user: user.to_string(),
        }),
        ("REPORT", ["sdk", "eval", env_id, "user"]) => Some(Endpoint::BrowserEvalUserBody {
            env_id: env_id.to_string(),
        }),

        ("GET", ["sdk", "goals", env_id]) => Some(Endpoint::Goals {
            env_id: env_id.to_string(),
        }),

        _ => None,
    }
}
