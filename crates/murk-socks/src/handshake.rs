//! The proxy's side of the SOCKS5 handshake, as a pure state machine.

use murk_bytes::Reader;

use crate::msg::{SocksAddr, SocksCmd, SocksRequest, SocksStatus};
use crate::{Error, Result};

/// An action to take in response to bytes received during a SOCKS
/// handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    /// Remove this many bytes from the front of the input buffer; they
    /// have been consumed.
    pub drain: usize,
    /// If nonempty, send this reply to the client.
    pub reply: Vec<u8>,
    /// If true, the handshake is over, successfully or not.
    pub finished: bool,
}

/// The state of an in-progress SOCKS5 handshake, proxy side.
///
/// Feed it the bytes read so far with [`handshake`](Self::handshake).  An
/// [`Error::Truncated`] result means the client's message is not yet
/// complete: read more bytes and call again with the longer buffer.  Any
/// other error, or an [`Action`] with `finished` set and no stored
/// request, means the conversation failed.
#[derive(Clone, Debug, Default)]
pub struct SocksProxyHandshake {
    /// Where we are in the conversation.
    state: State,
    /// The validated request, once the client has sent one.
    request: Option<SocksRequest>,
}

/// Position in the SOCKS5 conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum State {
    /// Waiting for the version and authentication methods.
    #[default]
    Initial,
    /// Methods negotiated; waiting for the request.
    WaitingForRequest,
    /// Handshake complete; a request is stored.
    Done,
    /// Handshake failed.
    Failed,
}

/// The SOCKS5 "no authentication" method code.
const NO_AUTHENTICATION: u8 = 0;
/// The SOCKS5 "no acceptable methods" refusal code.
const NO_ACCEPTABLE_METHODS: u8 = 0xff;

impl SocksProxyHandshake {
    /// Construct a handshake in its initial state.
    pub fn new() -> Self {
        SocksProxyHandshake::default()
    }

    /// Advance the handshake with the bytes received so far.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Action> {
        match self.state {
            State::Initial => self.negotiate_methods(input),
            State::WaitingForRequest => self.read_request(input),
            State::Done | State::Failed => Err(Error::AlreadyFinished),
        }
    }

    /// Return true if the handshake has reached a final state.
    pub fn finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Consume the handshake, returning the request if one was completed.
    pub fn into_request(self) -> Option<SocksRequest> {
        self.request
    }

    /// Handle the version/methods message.
    fn negotiate_methods(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        let version = r.take_u8()?;
        if version != 5 {
            self.state = State::Failed;
            return Err(Error::BadProtocol(version));
        }
        let n_methods = usize::from(r.take_u8()?);
        let methods = r.take(n_methods)?;

        if methods.contains(&NO_AUTHENTICATION) {
            self.state = State::WaitingForRequest;
            Ok(Action {
                drain: r.consumed(),
                reply: vec![5, NO_AUTHENTICATION],
                finished: false,
            })
        } else {
            // No method we speak; refuse and let the client hang up.
            self.state = State::Failed;
            Ok(Action {
                drain: r.consumed(),
                reply: vec![5, NO_ACCEPTABLE_METHODS],
                finished: true,
            })
        }
    }

    /// Handle the request message.
    fn read_request(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        let version = r.take_u8()?;
        if version != 5 {
            self.state = State::Failed;
            return Err(Error::BadProtocol(version));
        }
        let cmd: SocksCmd = r.take_u8()?.into();
        if r.take_u8()? != 0 {
            self.state = State::Failed;
            return Err(Error::Syntax);
        }
        let addr: SocksAddr = r.extract()?;
        let port = r.take_u16()?;

        let request = SocksRequest::new(cmd, addr, port);
        if !cmd.recognized() {
            // Answer with a proper refusal rather than dropping the
            // connection, so well-behaved clients get a diagnosis.
            let reply = request.reply(SocksStatus::COMMAND_NOT_SUPPORTED, None);
            self.state = State::Failed;
            return Ok(Action {
                drain: r.consumed(),
                reply,
                finished: true,
            });
        }

        self.state = State::Done;
        self.request = Some(request);
        Ok(Action {
            drain: r.consumed(),
            // The reply depends on the outcome of acting on the request,
            // so the proxy sends it separately.
            reply: Vec::new(),
            finished: true,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn connect_exchange() {
        let mut hs = SocksProxyHandshake::new();

        // Version 5, two methods: no-auth and gssapi.
        let action = hs.handshake(&hex!("05 02 00 01")).unwrap();
        assert_eq!(action.drain, 4);
        assert_eq!(action.reply, [5, 0]);
        assert!(!action.finished);

        // CONNECT to 192.0.2.7:80.
        let action = hs.handshake(&hex!("05 01 00 01 c0000207 0050")).unwrap();
        assert_eq!(action.drain, 10);
        assert!(action.reply.is_empty());
        assert!(action.finished);
        assert!(hs.finished());

        let req = hs.into_request().unwrap();
        assert_eq!(req.cmd(), SocksCmd::CONNECT);
        assert_eq!(req.addr().to_string(), "192.0.2.7");
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn udp_associate_exchange() {
        let mut hs = SocksProxyHandshake::new();
        hs.handshake(&hex!("05 01 00")).unwrap();
        // UDP ASSOCIATE with an all-zero client address.
        let action = hs.handshake(&hex!("05 03 00 01 00000000 0000")).unwrap();
        assert!(action.finished);
        let req = hs.into_request().unwrap();
        assert_eq!(req.cmd(), SocksCmd::UDP_ASSOCIATE);
    }

    #[test]
    fn hostname_request() {
        let mut hs = SocksProxyHandshake::new();
        hs.handshake(&hex!("05 01 00")).unwrap();
        let action = hs
            .handshake(&hex!("05 01 00 03 0b 6578616d706c652e636f6d 01bb"))
            .unwrap();
        assert!(action.finished);
        let req = hs.into_request().unwrap();
        assert_eq!(req.addr(), &SocksAddr::Hostname("example.com".into()));
        assert_eq!(req.port(), 443);
    }

    #[test]
    fn truncated_messages_ask_for_more() {
        let mut hs = SocksProxyHandshake::new();
        assert!(matches!(hs.handshake(&hex!("05")), Err(Error::Truncated)));
        assert!(matches!(
            hs.handshake(&hex!("05 02 00")),
            Err(Error::Truncated)
        ));
        // The full message still works afterwards.
        let action = hs.handshake(&hex!("05 02 00 01")).unwrap();
        assert!(!action.finished);

        assert!(matches!(
            hs.handshake(&hex!("05 01 00 01 c00002")),
            Err(Error::Truncated)
        ));
        let action = hs.handshake(&hex!("05 01 00 01 c0000207 0050")).unwrap();
        assert!(action.finished);
    }

    #[test]
    fn wrong_version_rejected() {
        let mut hs = SocksProxyHandshake::new();
        assert!(matches!(
            hs.handshake(&hex!("04 01 00")),
            Err(Error::BadProtocol(4))
        ));
        // Failed is final.
        assert!(matches!(
            hs.handshake(&hex!("05 01 00")),
            Err(Error::AlreadyFinished)
        ));
    }

    #[test]
    fn no_acceptable_methods_refused() {
        let mut hs = SocksProxyHandshake::new();
        // Only username/password offered.
        let action = hs.handshake(&hex!("05 01 02")).unwrap();
        assert_eq!(action.reply, [5, 0xff]);
        assert!(action.finished);
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn bind_refused_with_status() {
        let mut hs = SocksProxyHandshake::new();
        hs.handshake(&hex!("05 01 00")).unwrap();
        let action = hs.handshake(&hex!("05 02 00 01 c0000207 0050")).unwrap();
        assert!(action.finished);
        // Status byte 7: command not supported.
        assert_eq!(action.reply[1], 7);
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn trailing_bytes_left_in_buffer() {
        let mut hs = SocksProxyHandshake::new();
        // Methods message with the start of the request already appended.
        let action = hs.handshake(&hex!("05 01 00 05 01 00")).unwrap();
        assert_eq!(action.drain, 3);
        assert!(!action.finished);
    }
}
