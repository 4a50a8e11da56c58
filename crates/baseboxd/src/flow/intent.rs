//! Declarative descriptions of flow and group table entries.

use std::collections::HashSet;

use basebox_common::HasRefCount;
use basebox_ofdpa::{
    Action, Bucket, FlowMod, FlowModCommand, GroupMod, GroupModCommand, GroupType, Instruction,
    Match, OfdpaTable,
};
use basebox_types::LogicalPortId;

/// Identity of a flow entry as the datapath sees it for strict commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub table: OfdpaTable,
    pub priority: u16,
    pub match_fields: Match,
}

/// A flow entry that should be present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowIntent {
    pub table: OfdpaTable,
    pub priority: u16,
    pub match_fields: Match,
    pub instructions: Vec<Instruction>,
    pub cookie: u64,
    pub flags: u16,
    /// Port the entry belongs to; `None` for switch-wide entries.
    pub port: Option<LogicalPortId>,
}

impl FlowIntent {
    pub fn new(table: OfdpaTable, priority: u16, match_fields: Match) -> Self {
        Self {
            table,
            priority,
            match_fields,
            instructions: Vec::new(),
            cookie: 0,
            flags: 0,
            port: None,
        }
    }

    pub fn with_instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn for_port(mut self, port: LogicalPortId) -> Self {
        self.port = Some(port);
        self
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            match_fields: self.match_fields.clone(),
        }
    }

    /// Groups referenced from write/apply actions.
    pub fn groups(&self) -> impl Iterator<Item = u32> + '_ {
        self.instructions
            .iter()
            .flat_map(|instruction| match instruction {
                Instruction::WriteActions(actions) | Instruction::ApplyActions(actions) => {
                    actions.as_slice()
                }
                _ => &[],
            })
            .filter_map(|action| match action {
                Action::Group(group_id) => Some(*group_id),
                _ => None,
            })
    }

    pub fn to_flow_mod(&self, command: FlowModCommand) -> FlowMod {
        let mut flow = FlowMod::new(self.table, command, self.priority)
            .with_match(self.match_fields.clone())
            .with_cookie(self.cookie)
            .with_flags(self.flags);
        // strict deletes only carry the key
        if command != FlowModCommand::DeleteStrict {
            flow.instructions = self.instructions.clone();
        }
        flow
    }
}

/// A group entry that should be present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupIntent {
    pub group_id: u32,
    pub group_type: GroupType,
    pub buckets: Vec<Bucket>,
    pub port: Option<LogicalPortId>,
}

impl GroupIntent {
    /// Indirect group with a single bucket.
    pub fn indirect(group_id: u32, actions: Vec<Action>) -> Self {
        Self {
            group_id,
            group_type: GroupType::Indirect,
            buckets: vec![Bucket::new(actions)],
            port: None,
        }
    }

    pub fn for_port(mut self, port: LogicalPortId) -> Self {
        self.port = Some(port);
        self
    }

    pub fn to_group_mod(&self, command: GroupModCommand) -> GroupMod {
        GroupMod {
            command,
            group_type: self.group_type,
            group_id: self.group_id,
            buckets: if command == GroupModCommand::Delete {
                Vec::new()
            } else {
                self.buckets.clone()
            },
        }
    }
}

/// An installed group and the number of installed flows pointing at it.
#[derive(Debug, Clone)]
pub(crate) struct GroupEntry {
    pub intent: GroupIntent,
    pub refs: u32,
}

impl GroupEntry {
    pub fn new(intent: GroupIntent) -> Self {
        Self { intent, refs: 0 }
    }
}

impl HasRefCount for GroupEntry {
    fn increment_ref(&mut self) -> u32 {
        self.refs += 1;
        self.refs
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.refs = self.refs.checked_sub(1)?;
        Some(self.refs)
    }

    fn ref_count(&self) -> u32 {
        self.refs
    }
}

/// Snapshot of everything currently installed on the datapath.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledIntents {
    pub flows: HashSet<FlowIntent>,
    pub groups: HashSet<GroupIntent>,
}

impl InstalledIntents {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty() && self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flows.len() + self.groups.len()
    }

    pub fn flows_in(&self, table: OfdpaTable) -> impl Iterator<Item = &FlowIntent> {
        self.flows.iter().filter(move |flow| flow.table == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basebox_ofdpa::OxmField;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_groups_referenced() {
        let intent = FlowIntent::new(OfdpaTable::Bridging, 2, Match::new())
            .with_instruction(Instruction::WriteActions(vec![Action::Group(0x000a_0003)]))
            .with_instruction(Instruction::GotoTable(60));
        assert_eq!(intent.groups().collect::<Vec<_>>(), vec![0x000a_0003]);
    }

    #[test]
    fn test_delete_strict_carries_key_only() {
        let intent = FlowIntent::new(
            OfdpaTable::AclPolicy,
            0xfff0,
            Match::new().with(OxmField::EthType(0x0806)),
        )
        .with_instruction(Instruction::GotoTable(60));

        let add = intent.to_flow_mod(FlowModCommand::Add);
        assert_eq!(add.instructions.len(), 1);
        let delete = intent.to_flow_mod(FlowModCommand::DeleteStrict);
        assert!(delete.instructions.is_empty());
        assert_eq!(delete.match_fields, intent.match_fields);
        assert_eq!(delete.priority, 0xfff0);
    }

    #[test]
    fn test_group_refcount() {
        let mut entry = GroupEntry::new(GroupIntent::indirect(1, vec![Action::output(1)]));
        assert_eq!(entry.decrement_ref(), None);
        assert_eq!(entry.increment_ref(), 1);
        assert_eq!(entry.decrement_ref(), Some(0));
    }
}
