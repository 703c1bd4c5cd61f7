//! End-to-end reply tracking through `BackendConnection`

use gatewire_protocol::constants::command::COM_QUERY;
use gatewire_protocol::constants::{SERVER_MORE_RESULTS_EXIST, SERVER_STATUS_AUTOCOMMIT};
use gatewire_protocol::messages;
use gatewire_protocol::{BackendConnection, Packet, ReplyState, ReplyStateMachine, ReplyStatus};
use proptest::prelude::*;

/// One result of a multi-result response
#[derive(Debug, Clone)]
enum ResultShape {
    Ok,
    Err,
    Rows { columns: u8, rows: u8 },
}

fn encode(shapes: &[ResultShape]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let last = shapes.len() - 1;
    for (i, shape) in shapes.iter().enumerate() {
        let status = if i == last {
            SERVER_STATUS_AUTOCOMMIT
        } else {
            SERVER_STATUS_AUTOCOMMIT | SERVER_MORE_RESULTS_EXIST
        };
        match shape {
            ResultShape::Ok => packets.push(messages::ok_packet(1, 1, 0, status, 0)),
            ResultShape::Err => {
                packets.push(messages::err_packet(1, 1064, "42000", "syntax error"))
            }
            ResultShape::Rows { columns, rows } => {
                packets.push(messages::column_count_packet(1, u64::from(*columns)));
                for c in 0..*columns {
                    packets.push(messages::column_definition_packet(2, &format!("c{}", c)));
                }
                packets.push(messages::eof_packet(3, 0, SERVER_STATUS_AUTOCOMMIT));
                for r in 0..*rows {
                    packets.push(messages::text_row_packet(4, &[Some(r.to_string().as_str())]));
                }
                packets.push(messages::eof_packet(5, 0, status));
            }
        }
    }
    packets
}

fn result_shape() -> impl Strategy<Value = ResultShape> {
    prop_oneof![
        Just(ResultShape::Ok),
        (1u8..6, 0u8..8).prop_map(|(columns, rows)| ResultShape::Rows { columns, rows }),
    ]
}

#[test]
fn test_result_set_scenario() {
    let mut conn = BackendConnection::new("db1:3306");
    conn.write_command(messages::command_packet(COM_QUERY, b"SELECT a, b FROM t"))
        .unwrap();

    let packets = encode(&[ResultShape::Rows {
        columns: 2,
        rows: 3,
    }]);
    let wire: Vec<u8> = packets
        .iter()
        .flat_map(|p| p.as_bytes().to_vec())
        .collect();

    let batch = conn.process_incoming(&wire);
    assert!(batch.response_ready);
    assert_eq!(batch.results_completed, 1);
    // Rows are relayed byte for byte
    assert_eq!(&batch.forward[..], &wire[..]);
    assert_eq!(conn.reply().rows(), 3);
}

#[test]
fn test_error_ends_chain() {
    let mut machine = ReplyStateMachine::new();
    machine.begin_response(COM_QUERY);

    let packets = encode(&[ResultShape::Ok, ResultShape::Err]);
    let statuses: Vec<_> = packets
        .iter()
        .map(|p| machine.consume(p).unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec![ReplyStatus::ResultComplete, ReplyStatus::ResponseComplete]
    );
    assert_eq!(machine.error().unwrap().code, 1064);
}

#[test]
fn test_byte_at_a_time_delivery() {
    let mut conn = BackendConnection::new("db1:3306");
    conn.write_command(messages::command_packet(COM_QUERY, b"SELECT 1; SELECT 2"))
        .unwrap();

    let packets = encode(&[
        ResultShape::Rows { columns: 1, rows: 1 },
        ResultShape::Rows { columns: 1, rows: 1 },
    ]);
    let wire: Vec<u8> = packets
        .iter()
        .flat_map(|p| p.as_bytes().to_vec())
        .collect();

    let mut forwarded = Vec::new();
    let mut ready = 0;
    let mut completed = 0;
    for b in &wire {
        let batch = conn.process_incoming(std::slice::from_ref(b));
        forwarded.extend_from_slice(&batch.forward);
        ready += usize::from(batch.response_ready);
        completed += batch.results_completed;
    }
    assert_eq!(forwarded, wire);
    assert_eq!(ready, 1);
    assert_eq!(completed, 2);
}

proptest! {
    #[test]
    fn prop_done_reached_once_per_command(shapes in proptest::collection::vec(result_shape(), 1..6)) {
        let mut machine = ReplyStateMachine::new();
        machine.begin_response(COM_QUERY);

        let mut done = 0;
        let mut completions = 0;
        for packet in encode(&shapes) {
            let status = machine.consume(&packet).unwrap();
            if status == ReplyStatus::ResponseComplete {
                done += 1;
            }
            if status.is_complete() {
                completions += 1;
            }
        }

        prop_assert_eq!(done, 1);
        prop_assert_eq!(completions, shapes.len());
        prop_assert_eq!(machine.state(), ReplyState::Done);
        prop_assert_eq!(machine.stats().responses, 1);
    }
}
