//! Persons: signer identities and their display info.
//!
//! Person info only moves forward. A signed update replaces the current info
//! when its signature timestamp is strictly newer; unsigned info never
//! replaces signed info. Applying anything else is a no-op.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::{domains, person_signing_bytes};
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::ValidationError;

/// Display attributes of a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDetails {
    pub nick: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl PersonDetails {
    /// Details with only a nick.
    pub fn nick(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            name: None,
            email: None,
        }
    }
}

/// A person's info, either self-signed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonInfo {
    Unsigned(PersonDetails),
    Signed {
        details: PersonDetails,
        signed_at: i64,
        signature: Ed25519Signature,
    },
}

impl PersonInfo {
    /// The display details.
    pub fn details(&self) -> &PersonDetails {
        match self {
            PersonInfo::Unsigned(details) => details,
            PersonInfo::Signed { details, .. } => details,
        }
    }

    /// Metadata describing this info's version.
    pub fn version(&self) -> PersonInfoVersion {
        match self {
            PersonInfo::Unsigned(_) => PersonInfoVersion::Unsigned,
            PersonInfo::Signed { signed_at, .. } => PersonInfoVersion::Signed(*signed_at),
        }
    }
}

/// Version metadata advertised for a person without the full info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonInfoVersion {
    Unsigned,
    Signed(i64),
}

impl PersonInfoVersion {
    /// Whether info at this version replaces info at `current`.
    pub fn supersedes(&self, current: &PersonInfoVersion) -> bool {
        match (self, current) {
            (PersonInfoVersion::Signed(new), PersonInfoVersion::Signed(old)) => new > old,
            (PersonInfoVersion::Signed(_), PersonInfoVersion::Unsigned) => true,
            (PersonInfoVersion::Unsigned, _) => false,
        }
    }
}

/// A person known to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub uuid: Uuid,
    pub public_key: Ed25519PublicKey,
    pub info: PersonInfo,
}

impl Person {
    /// A person with unsigned info.
    pub fn unsigned(uuid: Uuid, public_key: Ed25519PublicKey, details: PersonDetails) -> Self {
        Self {
            uuid,
            public_key,
            info: PersonInfo::Unsigned(details),
        }
    }

    /// A person whose info is signed with their own key.
    pub fn signed(uuid: Uuid, keypair: &Keypair, details: PersonDetails, signed_at: i64) -> Self {
        let bytes = person_signing_bytes(&uuid, &details, signed_at);
        let signature = keypair.sign_domain(domains::PERSON, &bytes);
        Self {
            uuid,
            public_key: keypair.public_key(),
            info: PersonInfo::Signed {
                details,
                signed_at,
                signature,
            },
        }
    }

    /// Version of the current info.
    pub fn version(&self) -> PersonInfoVersion {
        self.info.version()
    }

    /// Verify the self-signature, if any.
    pub fn verify(&self) -> Result<(), ValidationError> {
        match &self.info {
            PersonInfo::Unsigned(_) => Ok(()),
            PersonInfo::Signed {
                details,
                signed_at,
                signature,
            } => {
                let bytes = person_signing_bytes(&self.uuid, details, *signed_at);
                self.public_key
                    .verify_domain(domains::PERSON, &bytes, signature)
                    .map_err(|_| ValidationError::SignatureFailed {
                        entity: "person",
                        uuid: self.uuid,
                    })
            }
        }
    }

    /// Apply `update` if it supersedes the current info.
    ///
    /// Returns `Ok(true)` if the info changed. The update must describe the
    /// same person with the same key and carry a valid signature.
    pub fn apply(&mut self, update: &Person) -> Result<bool, ValidationError> {
        if update.uuid != self.uuid {
            return Err(ValidationError::StructuralError(format!(
                "person update for {} applied to {}",
                update.uuid, self.uuid
            )));
        }
        if update.public_key != self.public_key {
            return Err(ValidationError::PublicKeyMismatch(self.uuid));
        }
        if !update.version().supersedes(&self.version()) {
            return Ok(false);
        }
        update.verify()?;
        self.info = update.info.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn person_at(kp: &Keypair, uuid: Uuid, at: i64, nick: &str) -> Person {
        Person::signed(uuid, kp, PersonDetails::nick(nick), at)
    }

    #[test]
    fn test_signed_person_verifies() {
        let kp = Keypair::from_seed(&[3; 32]);
        let p = person_at(&kp, Uuid::new_v4(), 10, "alice");
        assert!(p.verify().is_ok());
    }

    #[test]
    fn test_unsigned_never_supersedes_signed() {
        let kp = Keypair::from_seed(&[3; 32]);
        let uuid = Uuid::new_v4();
        let mut current = person_at(&kp, uuid, 10, "alice");
        let update = Person::unsigned(uuid, kp.public_key(), PersonDetails::nick("mallory"));
        assert!(!current.apply(&update).unwrap());
        assert_eq!(current.info.details().nick, "alice");
    }

    #[test]
    fn test_signed_supersedes_unsigned() {
        let kp = Keypair::from_seed(&[3; 32]);
        let uuid = Uuid::new_v4();
        let mut current = Person::unsigned(uuid, kp.public_key(), PersonDetails::nick("a"));
        assert!(current.apply(&person_at(&kp, uuid, 1, "b")).unwrap());
        assert_eq!(current.version(), PersonInfoVersion::Signed(1));
    }

    #[test]
    fn test_forged_update_rejected() {
        let kp = Keypair::from_seed(&[3; 32]);
        let uuid = Uuid::new_v4();
        let mut current = person_at(&kp, uuid, 10, "alice");
        let mut forged = person_at(&kp, uuid, 20, "alice");
        if let PersonInfo::Signed { details, .. } = &mut forged.info {
            details.nick = "eve".into();
        }
        assert!(current.apply(&forged).is_err());
        assert_eq!(current.info.details().nick, "alice");
    }

    #[test]
    fn test_key_change_rejected() {
        let uuid = Uuid::new_v4();
        let mut current = person_at(&Keypair::from_seed(&[3; 32]), uuid, 10, "a");
        let other = person_at(&Keypair::from_seed(&[4; 32]), uuid, 20, "b");
        assert!(matches!(
            current.apply(&other),
            Err(ValidationError::PublicKeyMismatch(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_person_info_monotonic(current_at in 0i64..1000, update_at in 0i64..1000) {
            let kp = Keypair::from_seed(&[5; 32]);
            let uuid = Uuid::from_bytes([5; 16]);
            let mut current = person_at(&kp, uuid, current_at, "old");
            let update = person_at(&kp, uuid, update_at, "new");

            let changed = current.apply(&update).unwrap();
            if update_at > current_at {
                prop_assert!(changed);
                prop_assert_eq!(current.version(), PersonInfoVersion::Signed(update_at));
                prop_assert_eq!(&current.info.details().nick, "new");
            } else {
                prop_assert!(!changed);
                prop_assert_eq!(current.version(), PersonInfoVersion::Signed(current_at));
                prop_assert_eq!(&current.info.details().nick, "old");
            }
        }
    }
}
