use std::collections::VecDeque;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;

/// Minimal telnet option handling: refuse everything the server asks of us,
/// accept the server echoing (WONT to every DO, DO for WILL ECHO, DONT for
/// any other WILL), skip subnegotiations, unescape doubled IAC bytes, and
/// collapse the CR NUL bare-carriage-return encoding to a lone CR.
#[derive(Debug, Default)]
pub(crate) struct TelnetDecoder {
    state: State,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Data,
    Cr,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

impl TelnetDecoder {
    pub fn feed(&mut self, input: &[u8], payload: &mut VecDeque<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b'\r') => {
                    payload.push_back(b'\r');
                    State::Cr
                }
                (State::Data, b) => {
                    payload.push_back(b);
                    State::Data
                }
                (State::Cr, 0) => State::Data,
                (State::Cr, IAC) => State::Iac,
                (State::Cr, b'\r') => {
                    payload.push_back(b'\r');
                    State::Cr
                }
                (State::Cr, b) => {
                    payload.push_back(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    payload.push_back(IAC);
                    State::Data
                }
                (State::Iac, SB) => State::Sub,
                (State::Iac, verb @ (WILL | WONT | DO | DONT)) => State::Verb(verb),
                (State::Iac, _) => State::Data,
                (State::Verb(DO), opt) => {
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                    State::Data
                }
                (State::Verb(WILL), OPT_ECHO) => {
                    replies.extend_from_slice(&[IAC, DO, OPT_ECHO]);
                    State::Data
                }
                (State::Verb(WILL), opt) => {
                    replies.extend_from_slice(&[IAC, DONT, opt]);
                    State::Data
                }
                (State::Verb(_), _) => State::Data,
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
    }
}

/// Escape outgoing bytes: double IAC, send a bare carriage return as CR NUL.
pub(crate) fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            IAC => out.extend_from_slice(&[IAC, IAC]),
            b'\r' => out.extend_from_slice(b"\r\0"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut decoder = TelnetDecoder::default();
        let mut payload = VecDeque::new();
        let mut replies = Vec::new();
        decoder.feed(input, &mut payload, &mut replies);
        (payload.into_iter().collect(), replies)
    }

    #[test]
    fn plain_data_passes_through() {
        let (payload, replies) = run(b"login: ");
        assert_eq!(payload, b"login: ");
        assert!(replies.is_empty());
    }

    #[test]
    fn do_requests_are_refused() {
        let (payload, replies) = run(&[b'a', IAC, DO, 24, b'b']);
        assert_eq!(payload, b"ab");
        assert_eq!(replies, vec![IAC, WONT, 24]);
    }

    #[test]
    fn will_echo_is_accepted() {
        let (_, replies) = run(&[IAC, WILL, OPT_ECHO]);
        assert_eq!(replies, vec![IAC, DO, OPT_ECHO]);
    }

    #[test]
    fn other_will_offers_are_refused() {
        let (_, replies) = run(&[IAC, WILL, 3]);
        assert_eq!(replies, vec![IAC, DONT, 3]);
    }

    #[test]
    fn doubled_iac_is_literal() {
        let (payload, replies) = run(&[IAC, IAC, b'x']);
        assert_eq!(payload, vec![IAC, b'x']);
        assert!(replies.is_empty());
    }

    #[test]
    fn subnegotiation_is_skipped() {
        let (payload, _) = run(&[b'a', IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'b']);
        assert_eq!(payload, b"ab");
    }

    #[test]
    fn sequences_survive_chunk_splits() {
        let mut decoder = TelnetDecoder::default();
        let mut payload = VecDeque::new();
        let mut replies = Vec::new();
        decoder.feed(&[b'a', IAC], &mut payload, &mut replies);
        decoder.feed(&[DO], &mut payload, &mut replies);
        decoder.feed(&[5, b'b'], &mut payload, &mut replies);
        assert_eq!(payload.iter().copied().collect::<Vec<u8>>(), b"ab");
        assert_eq!(replies, vec![IAC, WONT, 5]);
    }

    #[test]
    fn encode_escapes_cr_and_iac() {
        assert_eq!(encode(b"show\r"), b"show\r\0");
        assert_eq!(encode(&[0xFF]), vec![0xFF, 0xFF]);
    }

    #[test]
    fn bare_carriage_return_loses_its_nul() {
        let (payload, _) = run(b"prompt> \r\0more\r\nend");
        assert_eq!(payload, b"prompt> \rmore\r\nend");
    }
}
