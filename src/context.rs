use crate::handler::{ConnectAction, UserData};
use crate::stream::HttpStream;
use hyper::Request;

/// Per-session state handed to every callback.
///
/// Created when a client request arrives and dropped when the session ends.
/// `connect_request` and `connect_host` are only populated once a CONNECT
/// has been accepted; `sub_session_no` counts the requests served inside an
/// interception loop.
pub struct SessionContext<D: UserData> {
    pub session_no: u64,
    pub sub_session_no: u64,
    pub connect_action: ConnectAction,
    /// Head of the original CONNECT request, preserved across the hijack.
    pub connect_request: Option<Request<()>>,
    /// Tunnel target, always in `host:port` form.
    pub connect_host: String,
    /// Free slot for the embedder.
    pub user_data: D,
    pub(crate) hijacked_tls: Option<HttpStream>,
}

impl<D: UserData> SessionContext<D> {
    pub(crate) fn new(session_no: u64) -> Self {
        SessionContext {
            session_no,
            sub_session_no: 0,
            connect_action: ConnectAction::None,
            connect_request: None,
            connect_host: String::new(),
            user_data: D::default(),
            hijacked_tls: None,
        }
    }
}
