use std::time::Duration;

use super::{ErrorTest, Protocol, TestCase, secs};

#[derive(Debug, Clone)]
pub struct ReliabilityParams {
    pub attempts: u32,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Percentage, 0..=100.
    pub min_success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceParams {
    pub message_size: usize,
    pub num_requests: usize,
    pub max_response_time: Duration,
    pub concurrent_clients: usize,
}

/// Interaction mode of a test case.
///
/// Resolved once from the boolean flags of the file format. When several
/// flags are set the first one in this order wins: chatroom, stop-and-wait,
/// multi-step, error handling, connection reliability, performance, then
/// UDP, then plain TCP.
#[derive(Debug, Clone)]
pub enum TestMode {
    Chatroom { messages: Vec<String> },
    StopAndWait { packets: Vec<String>, acks: Vec<String> },
    MultiStep,
    ErrorHandling { tests: Vec<ErrorTest> },
    ConnectionReliability(ReliabilityParams),
    Performance(PerformanceParams),
    Udp,
    Tcp { periodic: bool },
}

impl TestMode {
    pub fn from_case(case: &TestCase) -> Self {
        if case.chatroom {
            TestMode::Chatroom {
                messages: case.chat_messages(),
            }
        } else if case.stop_and_wait {
            TestMode::StopAndWait {
                packets: case.packets(),
                acks: case.acks(),
            }
        } else if case.multi_step {
            TestMode::MultiStep
        } else if case.error_handling {
            TestMode::ErrorHandling {
                tests: case.error_tests(),
            }
        } else if case.connection_reliability {
            TestMode::ConnectionReliability(ReliabilityParams {
                attempts: case.connection_attempts,
                connect_timeout: secs(case.connection_timeout),
                reconnect_delay: secs(case.reconnect_delay),
                min_success_rate: case.min_success_rate,
            })
        } else if case.performance {
            TestMode::Performance(PerformanceParams {
                message_size: case.message_size,
                num_requests: case.num_requests,
                max_response_time: secs(case.max_response_time),
                concurrent_clients: case.concurrent_clients,
            })
        } else if case.protocol == Protocol::Udp {
            TestMode::Udp
        } else {
            TestMode::Tcp {
                periodic: case.periodic_send,
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TestMode::Chatroom { .. } => "chatroom",
            TestMode::StopAndWait { .. } => "stop-and-wait",
            TestMode::MultiStep => "multi-step",
            TestMode::ErrorHandling { .. } => "error-handling",
            TestMode::ConnectionReliability(_) => "connection-reliability",
            TestMode::Performance(_) => "performance",
            TestMode::Udp => "udp",
            TestMode::Tcp { .. } => "tcp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_flag_in_priority_order_wins() {
        let case = TestCase {
            performance: true,
            multi_step: true,
            chatroom: true,
            protocol: Protocol::Udp,
            ..Default::default()
        };
        assert!(matches!(TestMode::from_case(&case), TestMode::Chatroom { .. }));

        let case = TestCase {
            performance: true,
            error_handling: true,
            ..Default::default()
        };
        assert!(matches!(
            TestMode::from_case(&case),
            TestMode::ErrorHandling { .. }
        ));

        let case = TestCase {
            performance: true,
            protocol: Protocol::Udp,
            ..Default::default()
        };
        assert!(matches!(TestMode::from_case(&case), TestMode::Performance(_)));
    }

    #[test]
    fn udp_beats_default_tcp() {
        let case = TestCase {
            protocol: Protocol::Udp,
            periodic_send: true,
            ..Default::default()
        };
        assert_eq!(TestMode::from_case(&case).name(), "udp");
    }

    #[test]
    fn periodic_send_modifies_tcp() {
        let case = TestCase {
            periodic_send: true,
            ..Default::default()
        };
        assert!(matches!(
            TestMode::from_case(&case),
            TestMode::Tcp { periodic: true }
        ));
    }

    #[test]
    fn mode_parameters_take_defaults() {
        let case = TestCase {
            stop_and_wait: true,
            ..Default::default()
        };
        match TestMode::from_case(&case) {
            TestMode::StopAndWait { packets, acks } => {
                assert_eq!(packets, vec!["pkt1", "pkt2", "pkt3"]);
                assert_eq!(acks, vec!["ACK1", "ACK2", "ACK3"]);
            }
            other => panic!("wrong mode {other:?}"),
        }
        let case = TestCase {
            connection_reliability: true,
            ..Default::default()
        };
        match TestMode::from_case(&case) {
            TestMode::ConnectionReliability(p) => {
                assert_eq!(p.attempts, 5);
                assert_eq!(p.min_success_rate, 80.0);
            }
            other => panic!("wrong mode {other:?}"),
        }
    }
}
