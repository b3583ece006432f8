/*!
Topic alias bookkeeping for a single connection, outbound and inbound.
 */

use crate::error::{MqttError, MqttResult};

use std::collections::HashMap;

/// Outcome of an outbound topic alias resolution attempt, applied as a
/// Publish packet is prepared for encoding.
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct OutboundAliasResolution {
    /// Encode the packet with an empty topic; the broker already knows the
    /// binding.
    pub skip_topic: bool,

    /// Alias to place in the packet, if any.
    pub alias: Option<u16>,
}

/// Maps topics to the aliases this client has taught the broker.
///
/// The first publish on a topic goes out with both the topic and a freshly
/// allocated alias; subsequent publishes on that topic carry only the alias.
/// Once the broker's alias space is exhausted, further topics are sent in
/// full.
pub(crate) struct OutboundAliasTable {
    maximum_alias_value: u16,

    assignments: HashMap<String, u16>,
}

impl OutboundAliasTable {
    pub fn new() -> OutboundAliasTable {
        OutboundAliasTable {
            maximum_alias_value: 0,
            assignments: HashMap::new(),
        }
    }

    /// Applies the topic-alias-maximum the broker advertised in its CONNACK.
    /// Zero forbids aliasing entirely.
    pub fn reset_for_new_connection(&mut self, maximum_alias_value: u16) {
        self.maximum_alias_value = maximum_alias_value;
        self.assignments.clear();
    }

    pub fn resolve_and_apply_topic_alias(&mut self, topic: &str) -> OutboundAliasResolution {
        if self.maximum_alias_value == 0 {
            return OutboundAliasResolution { ..Default::default() };
        }

        if let Some(existing_alias) = self.assignments.get(topic) {
            return OutboundAliasResolution {
                skip_topic: true,
                alias: Some(*existing_alias),
            };
        }

        if self.assignments.len() < self.maximum_alias_value as usize {
            let new_alias = (self.assignments.len() + 1) as u16;
            self.assignments.insert(topic.to_string(), new_alias);
            return OutboundAliasResolution {
                skip_topic: false,
                alias: Some(new_alias),
            };
        }

        OutboundAliasResolution { ..Default::default() }
    }
}

/// Maps aliases the broker has used back to their topics.
pub(crate) struct InboundAliasTable {
    maximum_alias_value: u16,

    bindings: HashMap<u16, String>,
}

impl InboundAliasTable {
    pub fn new(maximum_alias_value: u16) -> InboundAliasTable {
        InboundAliasTable {
            maximum_alias_value,
            bindings: HashMap::new(),
        }
    }

    pub fn reset_for_new_connection(&mut self) {
        self.bindings.clear();
    }

    /// Resolves the alias on an inbound publish, rewriting an empty topic to
    /// the bound value and learning new bindings from full-topic publishes.
    pub fn resolve_topic_alias(&mut self, alias: &Option<u16>, topic: &mut String) -> MqttResult<()> {
        if let Some(alias_value) = alias {
            if topic.is_empty() {
                if let Some(bound_topic) = self.bindings.get(alias_value) {
                    *topic = bound_topic.clone();
                    return Ok(());
                }

                return Err(MqttError::new_inbound_topic_alias_not_valid("no binding exists for topic-less publish"));
            }

            if *alias_value == 0 || *alias_value > self.maximum_alias_value {
                return Err(MqttError::new_inbound_topic_alias_not_valid("publish alias value out of negotiated range"));
            }

            self.bindings.insert(*alias_value, topic.clone());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn outbound_alias_disabled_when_server_maximum_is_zero() {
        let mut table = OutboundAliasTable::new();
        table.reset_for_new_connection(0);

        assert_eq!(table.resolve_and_apply_topic_alias("some/topic"),
                   OutboundAliasResolution { skip_topic: false, alias: None });
    }

    #[test]
    fn outbound_alias_allocated_then_reused() {
        let mut table = OutboundAliasTable::new();
        table.reset_for_new_connection(4);

        assert_eq!(table.resolve_and_apply_topic_alias("some/topic"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(1) });
        assert_eq!(table.resolve_and_apply_topic_alias("some/other/topic"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(2) });
        assert_eq!(table.resolve_and_apply_topic_alias("some/topic"),
                   OutboundAliasResolution { skip_topic: true, alias: Some(1) });
        assert_eq!(table.resolve_and_apply_topic_alias("some/other/topic"),
                   OutboundAliasResolution { skip_topic: true, alias: Some(2) });
    }

    #[test]
    fn outbound_alias_full_table_sends_full_topic() {
        let mut table = OutboundAliasTable::new();
        table.reset_for_new_connection(2);

        assert_eq!(table.resolve_and_apply_topic_alias("a"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(1) });
        assert_eq!(table.resolve_and_apply_topic_alias("b"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(2) });
        assert_eq!(table.resolve_and_apply_topic_alias("c"),
                   OutboundAliasResolution { skip_topic: false, alias: None });

        // existing bindings stay valid
        assert_eq!(table.resolve_and_apply_topic_alias("a"),
                   OutboundAliasResolution { skip_topic: true, alias: Some(1) });
    }

    #[test]
    fn outbound_alias_reset_drops_bindings() {
        let mut table = OutboundAliasTable::new();
        table.reset_for_new_connection(2);

        assert_eq!(table.resolve_and_apply_topic_alias("a"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(1) });

        table.reset_for_new_connection(2);
        assert_eq!(table.resolve_and_apply_topic_alias("a"),
                   OutboundAliasResolution { skip_topic: false, alias: Some(1) });
    }

    #[test]
    fn inbound_alias_learns_and_resolves() {
        let mut table = InboundAliasTable::new(10);

        let mut topic = "telemetry/battery".to_string();
        assert!(table.resolve_topic_alias(&Some(3), &mut topic).is_ok());

        let mut aliased = String::new();
        assert!(table.resolve_topic_alias(&Some(3), &mut aliased).is_ok());
        assert_eq!(aliased, "telemetry/battery");
    }

    #[test]
    fn inbound_alias_rebinding_replaces_topic() {
        let mut table = InboundAliasTable::new(10);

        let mut first = "one".to_string();
        let mut second = "two".to_string();
        assert!(table.resolve_topic_alias(&Some(1), &mut first).is_ok());
        assert!(table.resolve_topic_alias(&Some(1), &mut second).is_ok());

        let mut resolved = String::new();
        assert!(table.resolve_topic_alias(&Some(1), &mut resolved).is_ok());
        assert_eq!(resolved, "two");
    }

    #[test]
    fn inbound_alias_failures() {
        let mut table = InboundAliasTable::new(10);

        let mut topic = "t".to_string();
        assert_matches!(table.resolve_topic_alias(&Some(0), &mut topic),
                        Err(MqttError::InboundTopicAliasNotValid(_)));
        assert_matches!(table.resolve_topic_alias(&Some(11), &mut topic),
                        Err(MqttError::InboundTopicAliasNotValid(_)));

        let mut unbound = String::new();
        assert_matches!(table.resolve_topic_alias(&Some(2), &mut unbound),
                        Err(MqttError::InboundTopicAliasNotValid(_)));
    }

    #[test]
    fn inbound_alias_reset_forgets_bindings() {
        let mut table = InboundAliasTable::new(10);

        let mut topic = "t".to_string();
        assert!(table.resolve_topic_alias(&Some(1), &mut topic).is_ok());

        table.reset_for_new_connection();

        let mut unbound = String::new();
        assert_matches!(table.resolve_topic_alias(&Some(1), &mut unbound),
                        Err(MqttError::InboundTopicAliasNotValid(_)));
    }
}
