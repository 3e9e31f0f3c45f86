#[cfg(test)]
mod tests {
    use wildmesh_core::*;

    // ── NodeId tests ───────────────────────────────────────────

    #[test]
    fn test_node_id_display_is_hex() {
        let id = NodeId::new(0x2a);
        assert_eq!(id.to_string(), "0000002a");
        assert_eq!(format!("{id:?}"), "NodeId(0000002a)");
    }

    #[test]
    fn test_node_id_parse_decimal_and_hex() {
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId::new(42));
        assert_eq!("0x2a".parse::<NodeId>().unwrap(), NodeId::new(42));
        assert!("node-7".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_ordering_follows_raw_value() {
        assert!(NodeId::new(1) < NodeId::new(2));
    }

    #[test]
    fn test_destination_accepts() {
        let me = NodeId::new(3);
        assert!(Destination::Broadcast.accepts(me));
        assert!(Destination::Node(me).accepts(me));
        assert!(!Destination::Node(NodeId::new(4)).accepts(me));
    }

    // ── Capabilities tests ─────────────────────────────────────

    #[test]
    fn test_capabilities_from_names() {
        let caps = Capabilities::from_names(&["camera", "AI"]).unwrap();
        assert!(caps.has_camera());
        assert!(caps.has_ai());
        assert!(!caps.contains(Capabilities::SENSORS));
        assert_eq!(caps.to_string(), "ai,camera");
    }

    #[test]
    fn test_capabilities_unknown_name_rejected() {
        let err = Capabilities::from_names(&["laser"]).unwrap_err();
        assert!(err.contains("laser"));
    }

    #[test]
    fn test_capabilities_none_contains_nothing_but_none() {
        assert!(Capabilities::NONE.contains(Capabilities::NONE));
        assert!(!Capabilities::NONE.has_camera());
        assert_eq!(Capabilities::NONE.to_string(), "none");
    }

    #[test]
    fn test_capabilities_truncate_unknown_bits() {
        let caps = Capabilities::from_bits_truncate(0xff);
        assert_eq!(caps.bits(), 0x1f);
    }

    // ── Priority / TaskType tests ──────────────────────────────

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_task_type_required_capability() {
        assert_eq!(
            TaskType::ImageCapture.required_capability(),
            Capabilities::CAMERA
        );
        assert_eq!(
            TaskType::SpeciesDetection.required_capability(),
            Capabilities::AI
        );
        assert!(TaskType::DataUpload.required_capability().is_empty());
    }

    #[test]
    fn test_task_type_wire_name() {
        let json = serde_json::to_string(&TaskType::ImageCapture).unwrap();
        assert_eq!(json, "\"image_capture\"");
        assert_eq!(
            "image_capture".parse::<TaskType>().unwrap(),
            TaskType::ImageCapture
        );
    }

    #[test]
    fn test_task_status_flags() {
        assert!(TaskStatus::Assigned.is_in_flight());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(!TaskStatus::Reassigned.is_in_flight());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_codes_and_classes() {
        let err = MeshError::MaxRetries {
            transmission_id: 7,
            retries: 3,
        };
        assert_eq!(err.code(), "TX_MAX_RETRIES");
        assert_eq!(err.class(), ErrorClass::Delivery);
        assert!(err.to_string().contains("3 retries"));

        let err = MeshError::NodeInactive(NodeId::new(3));
        assert_eq!(err.class(), ErrorClass::Coordination);
        assert_eq!(err.code(), "NODE_INACTIVE");

        let err = MeshError::UnknownKind("teleport".into());
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MeshError = io_err.into();
        assert!(err.to_string().contains("file not found"));
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    // ── Event tests ────────────────────────────────────────────

    #[test]
    fn test_event_serde_tag() {
        let event = MeshEvent::TaskReassigned {
            task_id: 9,
            from: NodeId::new(3),
            to: NodeId::new(4),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "task_reassigned");
        let restored: MeshEvent = serde_json::from_value(json).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_payload_event_skips_data() {
        let event = MeshEvent::PayloadReceived {
            from: NodeId::new(1),
            len: 3,
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["len"], 3);
    }
}
