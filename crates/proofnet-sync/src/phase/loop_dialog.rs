//! Loop dialog types.

use crate::selection::SelectionValue;

/// Which dialog a statement loop iteration runs.
///
/// Wire codes are stable. Types added after version 1 carry their minimum
/// version, and a node never proposes a type its peer cannot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoopDialogType {
    /// Re-declare subscribed contexts and replicate their statements.
    StatementSubscription,
    /// Push statements created since the last round.
    NewStatements,
    /// Re-declare proof subscriptions and replicate the proofs.
    StatementProofSubscription,
    /// Push new proofs and signatures.
    NewSignedProofs,
    /// Push delegate trees of subscribed root contexts.
    DelegateTree,
    /// Push changed person records.
    Persons,
    /// Synchronize custody of deferred messages.
    DeferredMessages,
    /// End the loop and close the connection.
    Valediction,
}

impl LoopDialogType {
    pub const ALL: [LoopDialogType; 8] = [
        LoopDialogType::StatementSubscription,
        LoopDialogType::NewStatements,
        LoopDialogType::StatementProofSubscription,
        LoopDialogType::NewSignedProofs,
        LoopDialogType::DelegateTree,
        LoopDialogType::Persons,
        LoopDialogType::DeferredMessages,
        LoopDialogType::Valediction,
    ];

    pub const fn to_u16(self) -> u16 {
        match self {
            LoopDialogType::StatementSubscription => 1,
            LoopDialogType::NewStatements => 2,
            LoopDialogType::StatementProofSubscription => 3,
            LoopDialogType::NewSignedProofs => 4,
            LoopDialogType::DelegateTree => 5,
            LoopDialogType::Valediction => 6,
            LoopDialogType::Persons => 7,
            LoopDialogType::DeferredMessages => 8,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.to_u16() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            LoopDialogType::StatementSubscription => "StatementSubscription",
            LoopDialogType::NewStatements => "NewStatements",
            LoopDialogType::StatementProofSubscription => "StatementProofSubscription",
            LoopDialogType::NewSignedProofs => "NewSignedProofs",
            LoopDialogType::DelegateTree => "DelegateTree",
            LoopDialogType::Persons => "Persons",
            LoopDialogType::DeferredMessages => "DeferredMessages",
            LoopDialogType::Valediction => "Valediction",
        }
    }

    /// Lowest peer protocol version that can run this dialog.
    pub const fn required_version(self) -> u16 {
        match self {
            LoopDialogType::Persons | LoopDialogType::DeferredMessages => 2,
            _ => 1,
        }
    }

    /// Whether the dialog writes to the store and so runs under the lock.
    pub const fn is_persistent(self) -> bool {
        !matches!(self, LoopDialogType::Valediction)
    }
}

impl SelectionValue for LoopDialogType {
    fn code(self) -> u16 {
        self.to_u16()
    }

    fn from_code(code: u16) -> Option<Self> {
        Self::from_u16(code)
    }

    fn name(self) -> &'static str {
        LoopDialogType::name(self)
    }

    fn required_version(self) -> u16 {
        LoopDialogType::required_version(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_unique_and_stable() {
        let codes: HashSet<u16> = LoopDialogType::ALL.iter().map(|t| t.to_u16()).collect();
        assert_eq!(codes.len(), LoopDialogType::ALL.len());
        for t in LoopDialogType::ALL {
            assert_eq!(LoopDialogType::from_u16(t.to_u16()), Some(t));
        }
        assert_eq!(LoopDialogType::from_u16(0), None);
        assert_eq!(LoopDialogType::Valediction.to_u16(), 6);
    }

    #[test]
    fn test_supplemented_types_need_version_two() {
        assert_eq!(LoopDialogType::Persons.required_version(), 2);
        assert_eq!(LoopDialogType::NewStatements.required_version(), 1);
        assert!(!LoopDialogType::Valediction.is_persistent());
    }
}
