use super::{decode_line, Message};
use crossbeam_channel::Sender;
use log::debug;
use std::io::{BufRead, BufReader, Read};
use std::thread::JoinHandle;

/// How the detection stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Closed,
    TransportError(String),
}

#[derive(Debug)]
pub(crate) enum RelayEvent {
    Message(Message),
    Closed(StreamEnd),
}

/// Forward decoded lines from `source` into the mailbox until the stream ends.
///
/// The relay only ever touches the mailbox; a full mailbox blocks it until the
/// coordinator drains.
pub(crate) fn spawn_relay(
    source: impl Read + Send + 'static,
    mailbox: Sender<RelayEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pore-relay".into())
        .spawn(move || relay(source, mailbox))
}

fn relay(source: impl Read, mailbox: Sender<RelayEvent>) {
    let reader = BufReader::new(source);
    let mut end = StreamEnd::Closed;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                end = StreamEnd::TransportError(err.to_string());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(Message::Done) => debug!("ignoring Done sent by the detector"),
            Ok(message) => {
                if mailbox.send(RelayEvent::Message(message)).is_err() {
                    debug!("mailbox dropped; relay exiting");
                    return;
                }
            }
            Err(err) => {
                end = StreamEnd::TransportError(format!("undecodable message: {}", err));
                break;
            }
        }
    }
    debug!("detection stream ended: {:?}", end);
    let _ = mailbox.send(RelayEvent::Closed(end));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn collect(input: &'static str) -> Vec<RelayEvent> {
        let (tx, rx) = unbounded();
        spawn_relay(input.as_bytes(), tx).unwrap().join().unwrap();
        rx.try_iter().collect()
    }

    #[test]
    fn forwards_messages_then_closes() {
        let events = collect("{\"kind\":\"status_update\",\"data\":\"a\"}\n\n{\"kind\":\"done\"}\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RelayEvent::Message(Message::StatusUpdate(s)) if s == "a"
        ));
        assert!(matches!(&events[1], RelayEvent::Closed(StreamEnd::Closed)));
    }

    #[test]
    fn garbage_is_a_transport_error() {
        let events = collect("{\"kind\":\"status_update\",\"data\":\"a\"}\nnope\n{\"kind\":\"status_update\",\"data\":\"b\"}\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            RelayEvent::Closed(StreamEnd::TransportError(_))
        ));
    }
}
