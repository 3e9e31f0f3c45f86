#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    use wildmesh_config::LinkConfig;
    use wildmesh_core::{Destination, NodeId, Priority};
    use wildmesh_link::protocol::{Heartbeat, Message, MessageKind};
    use wildmesh_link::{
        Delivery, Envelope, FailureReason, LinkEvent, LinkTransport, RadioPort, ReliableLink,
        SimulatedRadio, TransmissionState,
    };

    const A: NodeId = NodeId::new(1);
    const B: NodeId = NodeId::new(2);

    fn link_config(chunk_size: usize, frames_per_tick: usize) -> LinkConfig {
        LinkConfig {
            chunk_size: Some(chunk_size),
            frames_per_tick,
            ..LinkConfig::default()
        }
    }

    fn pair(
        config: &LinkConfig,
        max_retries: u32,
    ) -> (SimulatedRadio, ReliableLink<RadioPort>, ReliableLink<RadioPort>) {
        let radio = SimulatedRadio::new(1024, 0.0, 7);
        let a = ReliableLink::new(A, radio.port(A), config, max_retries);
        let b = ReliableLink::new(B, radio.port(B), config, max_retries);
        (radio, a, b)
    }

    /// Tick both ends from `from` to `to` in `step` increments.
    fn run(
        a: &mut ReliableLink<RadioPort>,
        b: &mut ReliableLink<RadioPort>,
        from: u64,
        to: u64,
        step: u64,
    ) -> (Vec<LinkEvent>, Vec<Delivery>) {
        let mut events = Vec::new();
        let mut deliveries = Vec::new();
        let mut now = from;
        while now <= to {
            let out = a.process(now);
            events.extend(out.events);
            let out = b.process(now);
            deliveries.extend(out.deliveries);
            now += step;
        }
        (events, deliveries)
    }

    fn chunk_index(bytes: &[u8]) -> Option<u16> {
        match Envelope::decode(bytes).ok()?.message {
            Message::DataChunk(c) => Some(c.index),
            _ => None,
        }
    }

    // ── Delivery tests ─────────────────────────────────────────

    #[test]
    fn test_acknowledged_payload_completes_with_all_bytes_acked() {
        let (_radio, mut a, mut b) = pair(&link_config(200, 8), 3);
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let id = a
            .transmit(
                Destination::Node(B),
                MessageKind::DataChunk,
                &payload,
                Priority::Normal,
                true,
                0,
            )
            .unwrap();

        let (events, deliveries) = run(&mut a, &mut b, 0, 2_000, 100);

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, payload);
        assert_eq!(deliveries[0].source, A);
        assert_eq!(a.state_of(id), Some(TransmissionState::Complete));
        let summary = a.summary(id).unwrap();
        assert_eq!(summary.chunks, 8);
        assert_eq!(summary.bytes_acked, summary.total_bytes);
        assert_eq!(summary.retry_count, 0);
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::Completed { transmission_id, .. } if *transmission_id == id
        )));
        assert_eq!(a.stats().bytes_acked, 1500);
        assert!(a.is_idle());
    }

    #[test]
    fn test_only_missing_chunks_are_retransmitted() {
        let (radio, mut a, mut b) = pair(&link_config(200, 32), 3);
        let mut first_pass: HashSet<u16> = HashSet::new();
        radio.set_drop_filter(move |frame| {
            matches!(chunk_index(frame.bytes), Some(i) if (i == 3 || i == 17) && first_pass.insert(i))
        });

        let payload = vec![0xabu8; 5000];
        let id = a
            .transmit(
                Destination::Node(B),
                MessageKind::DataChunk,
                &payload,
                Priority::Normal,
                true,
                0,
            )
            .unwrap();
        assert_eq!(a.transmission(id).unwrap().chunk_count(), 25);

        a.process(0);
        assert_eq!(a.stats().packets_sent, 25);
        b.process(0);
        a.process(100);
        let tx = a.transmission(id).unwrap();
        assert_eq!(tx.state(), TransmissionState::AwaitingAck);
        assert_eq!(tx.acked_chunks(), 23);
        assert_eq!(tx.bytes_acked(), 23 * 200);

        let (_, deliveries) = run(&mut a, &mut b, 200, 60_000, 100);

        assert_eq!(a.stats().packets_sent, 27);
        assert_eq!(a.stats().retransmitted_chunks, 2);
        assert_eq!(a.stats().packets_lost, 2);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload.len(), 5000);
        let summary = a.summary(id).unwrap();
        assert_eq!(summary.state, TransmissionState::Complete);
        assert_eq!(summary.retry_count, 1);
        assert_eq!(summary.bytes_acked, 5000);
    }

    #[test]
    fn test_silent_peer_fails_after_exactly_max_retries_rounds() {
        let (radio, mut a, _b) = pair(&link_config(200, 8), 3);
        radio.set_online(B, false);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        a.on_error(move |id, err| sink.borrow_mut().push((id, err.code())));

        let id = a
            .transmit(
                Destination::Node(B),
                MessageKind::DataChunk,
                &[1u8; 600],
                Priority::High,
                true,
                0,
            )
            .unwrap();

        let mut failures = Vec::new();
        for now in (0..200_000).step_by(500) {
            for event in a.process(now).events {
                if let LinkEvent::Failed { reason, .. } = event {
                    failures.push(reason);
                }
            }
        }

        assert_eq!(failures, vec![FailureReason::MaxRetries { retries: 3 }]);
        // One initial round plus three retries, three chunks each.
        assert_eq!(a.stats().packets_sent, 12);
        assert_eq!(a.stats().retransmitted_chunks, 9);
        assert_eq!(a.state_of(id), Some(TransmissionState::Failed));
        assert_eq!(a.summary(id).unwrap().retry_count, 3);
        assert_eq!(*errors.borrow(), vec![(id, "TX_MAX_RETRIES")]);
    }

    #[test]
    fn test_zero_retries_fails_after_first_round() {
        let (radio, mut a, _b) = pair(&link_config(200, 8), 0);
        radio.set_online(B, false);
        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[1u8; 10], Priority::Normal, true, 0)
            .unwrap();
        for now in (0..60_000).step_by(500) {
            a.process(now);
        }
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.state_of(id), Some(TransmissionState::Failed));
    }

    #[test]
    fn test_deadline_fails_transmission() {
        let config = LinkConfig {
            transmission_ttl_ms: 5_000,
            ..link_config(200, 8)
        };
        let (radio, mut a, _b) = pair(&config, 10);
        radio.set_online(B, false);
        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[1u8; 10], Priority::Normal, true, 0)
            .unwrap();

        let mut reasons = Vec::new();
        for now in (0..20_000).step_by(500) {
            for event in a.process(now).events {
                if let Some(mesh_event) = event.to_mesh_event() {
                    reasons.push(mesh_event);
                }
            }
        }
        assert_eq!(
            reasons,
            vec![wildmesh_core::MeshEvent::DeliveryFailed {
                transmission_id: id,
                destination: Destination::Node(B),
                code: "TX_DEADLINE".into(),
            }]
        );
    }

    #[test]
    fn test_broadcast_is_fire_and_forget() {
        let (_radio, mut a, mut b) = pair(&link_config(200, 8), 3);
        let id = a
            .transmit(Destination::Broadcast, MessageKind::DataChunk, b"hello all", Priority::Low, true, 0)
            .unwrap();
        assert!(!a.transmission(id).unwrap().require_ack());

        let (_, deliveries) = run(&mut a, &mut b, 0, 500, 100);
        assert_eq!(a.state_of(id), Some(TransmissionState::Complete));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(b.stats().acks_sent, 0);
    }

    #[test]
    fn test_lost_ack_causes_redelivery_free_reack() {
        let (radio, mut a, mut b) = pair(&link_config(200, 8), 3);
        let mut dropped_ack = false;
        radio.set_drop_filter(move |frame| {
            let is_ack = matches!(
                Envelope::decode(frame.bytes).map(|e| e.message),
                Ok(Message::DataAck(_))
            );
            if is_ack && !dropped_ack {
                dropped_ack = true;
                return true;
            }
            false
        });

        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[5u8; 450], Priority::Normal, true, 0)
            .unwrap();
        let (_, deliveries) = run(&mut a, &mut b, 0, 60_000, 100);

        assert_eq!(deliveries.len(), 1);
        assert_eq!(a.state_of(id), Some(TransmissionState::Complete));
        assert_eq!(a.summary(id).unwrap().retry_count, 1);
        assert!(b.stats().duplicates >= 3);
    }

    #[test]
    fn test_late_ack_covering_the_rest_of_a_round_still_times_out() {
        let (radio, mut a, mut b) = pair(&link_config(100, 1), 3);
        let mut chunk0_drops = 0;
        let mut ack_drops = 0;
        radio.set_drop_filter(move |frame| {
            match Envelope::decode(frame.bytes).map(|e| e.message) {
                Ok(Message::DataChunk(c)) if c.index == 0 && chunk0_drops < 2 => {
                    chunk0_drops += 1;
                    true
                }
                Ok(Message::DataAck(_)) if ack_drops < 2 => {
                    ack_drops += 1;
                    true
                }
                _ => false,
            }
        });

        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[3u8; 300], Priority::Normal, true, 0)
            .unwrap();
        let (_, deliveries) = run(&mut a, &mut b, 0, 120_000, 100);

        // Round two resends chunk 0 (lost) and chunk 1, whose ack also
        // covers chunk 2. Round three carries chunk 0 alone.
        assert_eq!(deliveries.len(), 1);
        assert_eq!(a.state_of(id), Some(TransmissionState::Complete));
        assert_eq!(a.summary(id).unwrap().retry_count, 2);
        assert_eq!(a.stats().packets_sent, 6);
    }

    #[test]
    fn test_restarted_sender_is_heard_and_delivered() {
        let config = link_config(100, 8);
        let (radio, mut a, mut b) = pair(&config, 3);
        a.transmit(Destination::Node(B), MessageKind::DataChunk, b"before reboot", Priority::Normal, true, 0)
            .unwrap();
        let (_, deliveries) = run(&mut a, &mut b, 0, 1_000, 100);
        assert_eq!(deliveries.len(), 1);

        // Same station, fresh engine: sequence numbers and transmission
        // ids start over.
        let mut a = ReliableLink::new(A, radio.port(A), &config, 3);
        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, b"after reboot", Priority::Normal, true, 1_100)
            .unwrap();
        assert_eq!(id, 1);

        let out_a = a.process(1_100);
        assert!(out_a.events.is_empty());
        let out_b = b.process(1_100);
        assert_eq!(out_b.heard.len(), 1);
        assert_eq!(out_b.deliveries.len(), 1);
        assert_eq!(out_b.deliveries[0].payload, b"after reboot".to_vec());

        a.process(1_200);
        assert_eq!(a.state_of(id), Some(TransmissionState::Complete));
    }

    // ── Scheduling tests ───────────────────────────────────────

    fn scheduled_ids(port: &mut RadioPort) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Some(frame) = port.receive() {
            if let Ok(env) = Envelope::decode(&frame.bytes)
                && let Message::DataChunk(c) = env.message
            {
                ids.push(c.transmission_id);
            }
        }
        ids
    }

    #[test]
    fn test_critical_preempts_lower_priority_in_flight() {
        let radio = SimulatedRadio::new(1024, 0.0, 1);
        let mut a = ReliableLink::new(A, radio.port(A), &link_config(10, 1), 3);
        let mut observer = radio.port(B);
        let to_b = Destination::Node(B);

        let low = a.transmit(to_b, MessageKind::DataChunk, &[0u8; 30], Priority::Low, false, 0).unwrap();
        a.process(0);
        let high = a.transmit(to_b, MessageKind::DataChunk, &[0u8; 10], Priority::High, false, 1).unwrap();
        a.process(1);
        let critical = a
            .transmit(to_b, MessageKind::DataChunk, &[0u8; 10], Priority::Critical, false, 2)
            .unwrap();
        a.process(2);
        a.process(3);
        a.process(4);

        assert_eq!(
            scheduled_ids(&mut observer),
            vec![low, low, critical, high, low]
        );
        assert_eq!(a.state_of(low), Some(TransmissionState::Complete));
    }

    #[test]
    fn test_fifo_within_tier_and_frame_budget() {
        let radio = SimulatedRadio::new(1024, 0.0, 1);
        let mut a = ReliableLink::new(A, radio.port(A), &link_config(10, 2), 3);
        let mut observer = radio.port(B);
        let to_b = Destination::Node(B);

        let first = a.transmit(to_b, MessageKind::DataChunk, &[0u8; 10], Priority::Normal, false, 0).unwrap();
        let second = a.transmit(to_b, MessageKind::DataChunk, &[0u8; 10], Priority::Normal, false, 0).unwrap();
        let third = a.transmit(to_b, MessageKind::DataChunk, &[0u8; 10], Priority::Normal, false, 0).unwrap();

        a.process(0);
        assert_eq!(scheduled_ids(&mut observer), vec![first, second]);
        a.process(1);
        assert_eq!(scheduled_ids(&mut observer), vec![third]);
    }

    // ── Control tests ──────────────────────────────────────────

    #[test]
    fn test_cancel_stops_transmission() {
        let (_radio, mut a, _b) = pair(&link_config(200, 8), 3);
        let id = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[1u8; 100], Priority::Normal, true, 0)
            .unwrap();
        a.cancel(id).unwrap();
        let out = a.process(0);

        assert_eq!(out.events, vec![LinkEvent::Cancelled { transmission_id: id }]);
        assert_eq!(a.state_of(id), Some(TransmissionState::Cancelled));
        assert_eq!(a.stats().packets_sent, 0);
        assert_eq!(a.cancel(id).unwrap_err().code(), "TX_NOT_FOUND");
    }

    #[test]
    fn test_payload_over_chunk_limit_is_refused() {
        let config = LinkConfig {
            max_payload_chunks: 2,
            ..link_config(10, 8)
        };
        let (_radio, mut a, _b) = pair(&config, 3);
        let err = a
            .transmit(Destination::Node(B), MessageKind::DataChunk, &[0u8; 30], Priority::Normal, true, 0)
            .unwrap_err();
        assert_eq!(err.code(), "TX_PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn test_oversized_chunk_setting_is_clamped() {
        let radio = SimulatedRadio::new(512, 0.0, 1);
        let a = ReliableLink::new(A, radio.port(A), &link_config(400, 4), 3);
        assert_eq!(a.chunk_size(), wildmesh_link::chunk::chunk_size_for_frame(512));
        assert!(a.chunk_size() < 400);
    }

    // ── Receiver tests ─────────────────────────────────────────

    #[test]
    fn test_coordination_message_roundtrip() {
        let (_radio, mut a, mut b) = pair(&link_config(64, 8), 3);
        let heartbeat = Message::Heartbeat(Heartbeat {
            role: wildmesh_core::Role::Node,
            capabilities: wildmesh_core::Capabilities::CAMERA,
            battery_percent: Some(80),
            signal_quality: None,
            active_tasks: 0,
            uptime_ms: 1_000,
            coordinator: None,
        });
        a.send_message(Destination::Broadcast, &heartbeat, Priority::Normal, false, 0)
            .unwrap();

        let (_, deliveries) = run(&mut a, &mut b, 0, 1_000, 100);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].packet_type, MessageKind::Heartbeat);
        let decoded = Message::from_payload(deliveries[0].packet_type, &deliveries[0].payload).unwrap();
        assert_eq!(decoded, heartbeat);
    }

    #[test]
    fn test_garbage_frames_are_counted_and_dropped() {
        let radio = SimulatedRadio::new(1024, 0.0, 1);
        let mut noisy = radio.port(NodeId::new(9));
        let mut b = ReliableLink::new(B, radio.port(B), &link_config(64, 8), 3);

        noisy.send(Destination::Broadcast, b"\x00\x01garbage");
        noisy.send(
            Destination::Broadcast,
            br#"{"source":9,"destination":"broadcast","sequence":1,"message":{"kind":"warp"}}"#,
        );
        let out = b.process(0);

        assert!(out.heard.is_empty());
        assert_eq!(b.stats().decode_errors, 2);
    }

    #[test]
    fn test_incomplete_reassembly_expires() {
        let config = LinkConfig {
            reassembly_timeout_ms: 5_000,
            ..link_config(10, 8)
        };
        let (radio, mut a, mut b) = pair(&config, 3);
        radio.set_drop_filter(|frame| chunk_index(frame.bytes) == Some(1));
        a.transmit(Destination::Node(B), MessageKind::DataChunk, &[0u8; 30], Priority::Normal, false, 0)
            .unwrap();

        run(&mut a, &mut b, 0, 1_000, 100);
        assert_eq!(b.inbound_in_progress(), 1);
        b.process(6_000);
        assert_eq!(b.inbound_in_progress(), 0);
    }

    #[test]
    fn test_progress_callback_reports_acked_chunks() {
        let (_radio, mut a, mut b) = pair(&link_config(100, 8), 3);
        let progress = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&progress);
        a.on_progress(move |_, acked, total| sink.borrow_mut().push((acked, total)));
        let completed = Rc::new(RefCell::new(0));
        let done = Rc::clone(&completed);
        a.on_complete(move |_| *done.borrow_mut() += 1);

        a.transmit(Destination::Node(B), MessageKind::DataChunk, &[3u8; 300], Priority::Normal, true, 0)
            .unwrap();
        run(&mut a, &mut b, 0, 1_000, 100);

        assert_eq!(progress.borrow().last(), Some(&(3, 3)));
        assert_eq!(*completed.borrow(), 1);
    }
}
