#[cfg(test)]
mod tests {
    use wildmesh_config::{
        ConfigPatch, CoordinatorConfig, DeadlinePolicy, FieldName, FieldRejection, NetworkConfig,
    };
    use wildmesh_core::{
        Capabilities, Destination, MeshEvent, NodeId, Priority, Role, TaskStatus, TaskType,
    };
    use wildmesh_link::protocol::{ConfigAck, Message, TaskStatusReport};
    use wildmesh_mesh::{Coordinator, NodeRegistry, TaskRequest};

    const SELF: NodeId = NodeId::new(1);

    fn id(raw: u32) -> NodeId {
        NodeId::new(raw)
    }

    /// Registry of peers seen at t=0 with the given capabilities and signal.
    fn registry(nodes: &[(u32, Capabilities, f32)]) -> NodeRegistry {
        let mut reg = NodeRegistry::new(SELF, 90_000);
        for &(raw, caps, quality) in nodes {
            reg.observe(id(raw), quality, 1, 0);
            reg.update_profile(id(raw), Role::Node, caps, None);
        }
        reg
    }

    fn coordinator() -> Coordinator {
        coordinator_with(CoordinatorConfig::default())
    }

    fn coordinator_with(settings: CoordinatorConfig) -> Coordinator {
        Coordinator::new(SELF, Capabilities::CAMERA, settings)
    }

    fn report(task_id: u32, status: TaskStatus) -> TaskStatusReport {
        TaskStatusReport {
            task_id,
            status,
            detail: None,
            result: Vec::new(),
        }
    }

    // ── Assignment ─────────────────────────────────────────────

    mod assignment {
        use super::*;

        #[test]
        fn test_explicit_target_is_assigned() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.8)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();

            let task_id = coord
                .assign_task(
                    &reg,
                    &net,
                    TaskRequest::new(TaskType::ImageCapture)
                        .target(id(3))
                        .parameter("exposure", "auto"),
                    1_000,
                )
                .unwrap();
            assert_eq!(task_id, 1);

            let task = coord.task(task_id).unwrap();
            assert_eq!(task.assigned_node, id(3));
            assert_eq!(task.status, TaskStatus::Assigned);
            assert_eq!(task.deadline, 301_000);
            assert_eq!(task.attempts, 1);

            let outbox = coord.take_outbox();
            assert_eq!(outbox.len(), 1);
            assert_eq!(outbox[0].destination, Destination::Node(id(3)));
            assert!(outbox[0].require_ack);
            assert_eq!(outbox[0].task, Some(task_id));
            match &outbox[0].message {
                Message::TaskAssign(assign) => {
                    assert_eq!(assign.deadline_in_ms, 300_000);
                    assert_eq!(assign.parameters["exposure"], "auto");
                    assert_eq!(assign.attempt, 1);
                }
                other => panic!("expected task_assign, got {other:?}"),
            }

            assert_eq!(
                coord.take_events(),
                vec![MeshEvent::TaskAssigned {
                    task_id,
                    task_type: TaskType::ImageCapture,
                    node: id(3),
                }]
            );
        }

        #[test]
        fn test_explicit_deadline_is_kept() {
            let reg = registry(&[(2, Capabilities::CAMERA, 0.8)]);
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::VideoCapture).deadline(45_000),
                    5_000,
                )
                .unwrap();
            assert_eq!(coord.task(task_id).unwrap().deadline, 45_000);
        }

        #[test]
        fn test_unknown_target_rejected() {
            let reg = registry(&[]);
            let err = coordinator()
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::ImageCapture).target(id(9)),
                    0,
                )
                .unwrap_err();
            assert_eq!(err.code(), "NODE_UNKNOWN");
        }

        #[test]
        fn test_inactive_target_rejected() {
            let mut reg = registry(&[(3, Capabilities::CAMERA, 0.8)]);
            reg.tick(90_000);
            let err = coordinator()
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::ImageCapture).target(id(3)),
                    90_000,
                )
                .unwrap_err();
            assert_eq!(err.code(), "NODE_INACTIVE");
        }

        #[test]
        fn test_target_without_capability_rejected() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.8)]);
            let err = coordinator()
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::SpeciesDetection).target(id(3)),
                    0,
                )
                .unwrap_err();
            assert_eq!(err.code(), "TASK_CAPABILITY");
        }

        #[test]
        fn test_no_capable_candidate() {
            let reg = registry(&[(2, Capabilities::CAMERA, 0.8), (3, Capabilities::AI, 0.8)]);
            let mut coord = coordinator();
            let err = coord
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::SensorReading),
                    0,
                )
                .unwrap_err();
            assert_eq!(err.code(), "TASK_NO_CANDIDATE");
            assert!(coord.take_outbox().is_empty());
            assert_eq!(coord.tasks().count(), 0);
        }

        #[test]
        fn test_load_balancing_ranks_load_then_signal_then_id() {
            let reg = registry(&[
                (2, Capabilities::CAMERA, 0.6),
                (3, Capabilities::CAMERA, 0.9),
                (4, Capabilities::CAMERA, 0.9),
            ]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();

            let picks: Vec<NodeId> = (0..4)
                .map(|_| {
                    let task_id = coord
                        .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture), 0)
                        .unwrap();
                    coord.task(task_id).unwrap().assigned_node
                })
                .collect();
            assert_eq!(picks, vec![id(3), id(4), id(2), id(3)]);
            assert_eq!(coord.load_of(id(3)), 2);
        }

        #[test]
        fn test_without_load_balancing_lowest_id_wins() {
            let reg = registry(&[(4, Capabilities::CAMERA, 1.0), (2, Capabilities::CAMERA, 0.1)]);
            let net = NetworkConfig {
                load_balancing_enabled: false,
                ..NetworkConfig::default()
            };
            let mut coord = coordinator();
            for _ in 0..3 {
                let task_id = coord
                    .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture), 0)
                    .unwrap();
                assert_eq!(coord.task(task_id).unwrap().assigned_node, id(2));
            }
        }

        #[test]
        fn test_task_ids_are_monotonic() {
            let reg = registry(&[(2, Capabilities::NONE, 0.5)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let ids: Vec<u32> = (0..3)
                .map(|_| {
                    coord
                        .assign_task(&reg, &net, TaskRequest::new(TaskType::Maintenance), 0)
                        .unwrap()
                })
                .collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    // ── Reassignment ───────────────────────────────────────────

    mod reassignment {
        use super::*;

        /// Nodes 2, 3 and 4 with cameras; node 3 then goes silent.
        fn with_node_3_failed() -> NodeRegistry {
            let mut reg = registry(&[
                (2, Capabilities::CAMERA, 0.6),
                (3, Capabilities::CAMERA, 0.9),
                (4, Capabilities::CAMERA, 0.8),
            ]);
            reg.observe(id(2), 0.6, 1, 80_000);
            reg.observe(id(4), 0.8, 1, 80_000);
            assert_eq!(reg.tick(90_000), vec![MeshEvent::NodeFailed { node: id(3) }]);
            reg
        }

        #[test]
        fn test_failed_node_tasks_move_to_next_best() {
            let mut reg = registry(&[
                (2, Capabilities::CAMERA, 0.6),
                (3, Capabilities::CAMERA, 0.9),
                (4, Capabilities::CAMERA, 0.8),
            ]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let request = TaskRequest::new(TaskType::ImageCapture).target(id(3));
            let first = coord.assign_task(&reg, &net, request.clone(), 0).unwrap();
            let second = coord.assign_task(&reg, &net, request, 0).unwrap();
            coord.take_outbox();
            coord.take_events();

            reg.observe(id(2), 0.6, 1, 80_000);
            reg.observe(id(4), 0.8, 1, 80_000);
            reg.tick(90_000);

            let moved = coord.on_node_failed(&reg, &net, id(3), 90_000);
            assert_eq!(moved.len(), 2);
            assert_eq!(moved[0].to, Some(id(4)));
            assert_eq!(moved[1].to, Some(id(2)));
            assert!(moved.iter().all(|r| r.from == id(3) && r.at == 90_000));

            for task_id in [first, second] {
                let task = coord.task(task_id).unwrap();
                assert_eq!(task.status, TaskStatus::Assigned);
                assert!(reg.is_active(task.assigned_node));
                assert_eq!(task.attempts, 2);
                assert_eq!(task.deadline, 300_000);
            }
            assert_eq!(coord.reassignments().count(), 2);

            let outbox = coord.take_outbox();
            assert_eq!(outbox.len(), 2);
            assert!(outbox.iter().all(|o| o.priority == Priority::Critical));

            let events = coord.take_events();
            assert!(events.contains(&MeshEvent::TaskReassigned {
                task_id: first,
                from: id(3),
                to: id(4),
            }));
        }

        #[test]
        fn test_no_candidate_fails_task() {
            let mut reg = registry(&[(3, Capabilities::CAMERA, 0.9), (2, Capabilities::AI, 0.9)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture), 0)
                .unwrap();
            coord.take_events();

            reg.observe(id(2), 0.9, 1, 80_000);
            reg.tick(90_000);
            let moved = coord.on_node_failed(&reg, &net, id(3), 90_000);

            assert_eq!(moved[0].to, None);
            let task = coord.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(task.failure_reason.is_some());
            let events = coord.take_events();
            assert!(matches!(
                events.as_slice(),
                [MeshEvent::TaskFailed { task_id: t, .. }] if *t == task_id
            ));
        }

        #[test]
        fn test_finished_tasks_stay_put() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.9), (4, Capabilities::CAMERA, 0.5)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture).target(id(3)), 0)
                .unwrap();
            coord.on_task_status(id(3), report(task_id, TaskStatus::Completed));

            assert!(coord.on_node_failed(&reg, &net, id(3), 90_000).is_empty());
            assert_eq!(coord.task(task_id).unwrap().assigned_node, id(3));
        }

        #[test]
        fn test_fresh_deadline_policy() {
            let reg = with_node_3_failed();
            let net = NetworkConfig::default();
            let mut coord = coordinator_with(CoordinatorConfig {
                reassignment_deadline: DeadlinePolicy::Fresh,
                ..CoordinatorConfig::default()
            });

            // Assign while node 3 was still up.
            let up = registry(&[(3, Capabilities::CAMERA, 0.9)]);
            let task_id = coord
                .assign_task(&up, &net, TaskRequest::new(TaskType::ImageCapture).target(id(3)), 0)
                .unwrap();

            coord.on_node_failed(&reg, &net, id(3), 90_000);
            assert_eq!(coord.task(task_id).unwrap().deadline, 390_000);
        }

        #[test]
        fn test_undeliverable_assignment_is_reassigned() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.9), (4, Capabilities::CAMERA, 0.5)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture).target(id(3)), 0)
                .unwrap();
            coord.track_assignment(77, task_id);

            let moved = coord.on_delivery_failed(&reg, &net, 77, 10_000).unwrap();
            assert_eq!(moved.from, id(3));
            assert_eq!(moved.to, Some(id(4)));
            assert_eq!(coord.task(task_id).unwrap().assigned_node, id(4));

            // The same transmission cannot trigger a second move.
            assert!(coord.on_delivery_failed(&reg, &net, 77, 11_000).is_none());
        }

        #[test]
        fn test_delivery_failure_after_start_is_ignored() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.9), (4, Capabilities::CAMERA, 0.5)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture).target(id(3)), 0)
                .unwrap();
            coord.track_assignment(5, task_id);
            coord.on_task_status(id(3), report(task_id, TaskStatus::Running));

            assert!(coord.on_delivery_failed(&reg, &net, 5, 10_000).is_none());
            assert_eq!(coord.task(task_id).unwrap().assigned_node, id(3));
        }
    }

    // ── Task lifecycle ─────────────────────────────────────────

    mod lifecycle {
        use super::*;

        #[test]
        fn test_status_from_assignee_advances_task() {
            let reg = registry(&[(3, Capabilities::CAMERA, 0.9)]);
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::ImageCapture),
                    0,
                )
                .unwrap();
            coord.take_events();

            coord.on_task_status(id(3), report(task_id, TaskStatus::Running));
            assert_eq!(coord.task(task_id).unwrap().status, TaskStatus::Running);

            coord.on_task_status(
                id(3),
                TaskStatusReport {
                    result: vec![7; 40],
                    ..report(task_id, TaskStatus::Completed)
                },
            );
            let task = coord.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result.len(), 40);
            assert_eq!(coord.active_tasks().count(), 0);

            assert_eq!(
                coord.take_events(),
                vec![
                    MeshEvent::TaskStarted { task_id },
                    MeshEvent::TaskCompleted {
                        task_id,
                        node: id(3),
                        result_bytes: 40,
                    },
                ]
            );
        }

        #[test]
        fn test_stale_status_is_ignored() {
            let mut reg = registry(&[(3, Capabilities::CAMERA, 0.9), (4, Capabilities::CAMERA, 0.5)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture).target(id(3)), 0)
                .unwrap();

            reg.observe(id(4), 0.5, 1, 80_000);
            reg.tick(90_000);
            coord.on_node_failed(&reg, &net, id(3), 90_000);
            coord.take_events();

            coord.on_task_status(id(3), report(task_id, TaskStatus::Completed));
            let task = coord.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Assigned);
            assert_eq!(task.assigned_node, id(4));
            assert!(coord.take_events().is_empty());
        }

        #[test]
        fn test_failure_report_keeps_reason() {
            let reg = registry(&[(2, Capabilities::AI, 0.9)]);
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::SpeciesDetection),
                    0,
                )
                .unwrap();
            coord.on_task_status(
                id(2),
                TaskStatusReport {
                    detail: Some("model not loaded".into()),
                    ..report(task_id, TaskStatus::Failed)
                },
            );
            let task = coord.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.failure_reason.as_deref(), Some("model not loaded"));

            // Terminal tasks do not move again.
            coord.on_task_status(id(2), report(task_id, TaskStatus::Running));
            assert_eq!(coord.task(task_id).unwrap().status, TaskStatus::Failed);
        }

        #[test]
        fn test_deadline_expiry_fails_task() {
            let reg = registry(&[(2, Capabilities::CAMERA, 0.9)]);
            let mut coord = coordinator();
            let task_id = coord
                .assign_task(
                    &reg,
                    &NetworkConfig::default(),
                    TaskRequest::new(TaskType::ImageCapture).deadline(60_000),
                    0,
                )
                .unwrap();
            coord.take_events();

            coord.expire_tasks(59_999);
            assert_eq!(coord.task(task_id).unwrap().status, TaskStatus::Assigned);
            coord.expire_tasks(60_000);
            let task = coord.task(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.failure_reason.as_deref(), Some("deadline exceeded"));
            assert_eq!(coord.take_events().len(), 1);
        }

        #[test]
        fn test_history_prunes_oldest_finished_first() {
            let reg = registry(&[(2, Capabilities::CAMERA, 0.9)]);
            let net = NetworkConfig::default();
            let mut coord = coordinator_with(CoordinatorConfig {
                max_task_history: 2,
                ..CoordinatorConfig::default()
            });
            let ids: Vec<u32> = (0..5)
                .map(|_| {
                    coord
                        .assign_task(&reg, &net, TaskRequest::new(TaskType::ImageCapture), 0)
                        .unwrap()
                })
                .collect();
            for &task_id in &ids[..4] {
                coord.on_task_status(id(2), report(task_id, TaskStatus::Completed));
            }

            coord.prune_history();
            let remaining: Vec<u32> = coord.tasks().map(|t| t.task_id).collect();
            assert_eq!(remaining, vec![3, 4, 5]);
        }
    }

    // ── Configuration ──────────────────────────────────────────

    mod configuration {
        use super::*;

        #[test]
        fn test_update_applies_locally_and_broadcasts() {
            let mut net = NetworkConfig::default();
            let mut coord = coordinator();
            let patch = ConfigPatch::new().heartbeat_interval_ms(5_000).max_retries(5);

            let (update_id, report) = coord.broadcast_config_update(&mut net, patch.clone());
            assert_eq!(update_id, 1);
            assert_eq!(report.accepted, vec![FieldName::MaxRetries]);
            assert_eq!(report.rejected_names(), vec!["heartbeat_interval_ms"]);
            assert_eq!(net.max_retries, 5);
            assert_eq!(net.heartbeat_interval_ms, 30_000);

            let outbox = coord.take_outbox();
            assert_eq!(outbox.len(), 1);
            assert_eq!(outbox[0].destination, Destination::Broadcast);
            assert!(!outbox[0].require_ack);
            match &outbox[0].message {
                Message::ConfigUpdate(update) => assert_eq!(update.patch, patch),
                other => panic!("expected config_update, got {other:?}"),
            }
            assert!(coord.config_acks(update_id).unwrap().is_empty());
        }

        #[test]
        fn test_acks_are_tracked_per_update() {
            let mut net = NetworkConfig::default();
            let mut coord = coordinator();
            let (update_id, _) = coord.broadcast_config_update(
                &mut net,
                ConfigPatch::new().heartbeat_interval_ms(5_000).max_retries(5),
            );

            coord.on_config_ack(
                id(2),
                ConfigAck {
                    update_id,
                    accepted: vec![FieldName::MaxRetries],
                    rejected: vec![FieldRejection {
                        field: FieldName::HeartbeatInterval,
                        value: "5000".into(),
                        reason: "below minimum 10000".into(),
                    }],
                },
            );
            coord.on_config_ack(
                id(3),
                ConfigAck {
                    update_id: 99,
                    accepted: Vec::new(),
                    rejected: Vec::new(),
                },
            );

            let acks = coord.config_acks(update_id).unwrap();
            assert_eq!(acks.len(), 1);
            assert_eq!(acks[&id(2)].rejected[0].field, FieldName::HeartbeatInterval);
            assert!(coord.config_acks(99).is_none());
            assert_eq!(
                coord.take_events(),
                vec![MeshEvent::ConfigAckReceived {
                    update_id,
                    from: id(2),
                    rejected: vec!["heartbeat_interval_ms".into()],
                }]
            );
        }

        #[test]
        fn test_ack_history_keeps_latest_updates() {
            let mut net = NetworkConfig::default();
            let mut coord = coordinator_with(CoordinatorConfig {
                max_task_history: 3,
                ..CoordinatorConfig::default()
            });
            let ids: Vec<u32> = (0..5)
                .map(|n| {
                    coord
                        .broadcast_config_update(&mut net, ConfigPatch::new().max_retries(n))
                        .0
                })
                .collect();

            assert_eq!(ids, vec![1, 2, 3, 4, 5]);
            assert!(coord.config_acks(1).is_none());
            assert!(coord.config_acks(2).is_none());
            for update_id in 3..=5 {
                assert!(coord.config_acks(update_id).is_some());
            }
        }
    }

    // ── Topology ───────────────────────────────────────────────

    mod topology {
        use super::*;

        #[test]
        fn test_broadcast_on_start_change_and_interval() {
            let mut reg = registry(&[(2, Capabilities::CAMERA, 0.9)]);
            let mut coord = coordinator();

            assert!(coord.maybe_broadcast_topology(&reg, 1_000));
            assert_eq!(coord.topology().unwrap().version, 1);
            assert!(!coord.maybe_broadcast_topology(&reg, 2_000));

            reg.observe(id(3), 0.7, 1, 3_000);
            assert!(coord.maybe_broadcast_topology(&reg, 3_000));
            let topo = coord.topology().unwrap();
            assert_eq!(topo.version, 2);
            assert_eq!(topo.coordinator, SELF);
            assert_eq!(topo.nodes.len(), 3);

            let outbox = coord.take_outbox();
            assert_eq!(outbox.len(), 2);
            assert!(matches!(outbox[1].message, Message::TopologyBroadcast(_)));
        }

        #[test]
        fn test_stability_flip_triggers_broadcast() {
            let reg = registry(&[(2, Capabilities::CAMERA, 0.9)]);
            let mut coord = coordinator();

            coord.maybe_broadcast_topology(&reg, 1_000);
            assert!(!coord.topology().unwrap().stable);
            assert!(!coord.maybe_broadcast_topology(&reg, 59_999));
            assert!(coord.maybe_broadcast_topology(&reg, 60_000));
            assert!(coord.topology().unwrap().stable);

            let interval = CoordinatorConfig::default().topology_interval_ms;
            assert!(!coord.maybe_broadcast_topology(&reg, 60_000 + interval - 1));
            assert!(coord.maybe_broadcast_topology(&reg, 60_000 + interval));
        }
    }
}
