use crate::error::{CoreError, Result};
use crate::mentions::{IdentityDirectory, MentionTarget};
use crate::types::BotId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotProfile {
    pub name: String,
    /// Primary identity; doubles as the bot's id.
    pub number: String,
    /// Secondary identity the transport may report instead of the number.
    #[serde(default)]
    pub uuid: Option<String>,
    pub agent_id: String,
}

impl BotProfile {
    pub fn id(&self) -> BotId {
        BotId::new(self.number.clone())
    }

    pub fn has_identity(&self, identity: &str) -> bool {
        let identity = identity.trim();
        !identity.is_empty()
            && (identity == self.number
                || self
                    .uuid
                    .as_deref()
                    .is_some_and(|uuid| uuid.eq_ignore_ascii_case(identity)))
    }
}

/// The fixed set of bots sharing the conversational surface.
#[derive(Debug, Clone)]
pub struct BotRoster {
    bots: Vec<BotProfile>,
}

impl BotRoster {
    pub fn new(bots: Vec<BotProfile>) -> Result<Self> {
        if bots.is_empty() {
            return Err(CoreError::InvalidInput(
                "at least one bot is required".to_string(),
            ));
        }
        let mut names = HashSet::new();
        let mut numbers = HashSet::new();
        for bot in &bots {
            if bot.name.trim().is_empty() || bot.number.trim().is_empty() {
                return Err(CoreError::InvalidInput(
                    "bot name and number are required".to_string(),
                ));
            }
            if !names.insert(bot.name.to_ascii_lowercase()) {
                return Err(CoreError::InvalidInput(format!(
                    "duplicate bot name: {}",
                    bot.name
                )));
            }
            if !numbers.insert(bot.number.clone()) {
                return Err(CoreError::InvalidInput(format!(
                    "duplicate bot number: {}",
                    bot.number
                )));
            }
        }
        Ok(Self { bots })
    }

    pub fn bots(&self) -> &[BotProfile] {
        &self.bots
    }

    pub fn bot_ids(&self) -> Vec<BotId> {
        self.bots.iter().map(BotProfile::id).collect()
    }

    pub fn get(&self, bot: &BotId) -> Option<&BotProfile> {
        self.bots.iter().find(|profile| profile.number == bot.as_str())
    }

    pub fn by_name(&self, name: &str) -> Option<&BotProfile> {
        self.bots
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Finds the bot owning `identity`, by number or uuid.
    pub fn resolve(&self, identity: &str) -> Option<&BotProfile> {
        self.bots.iter().find(|profile| profile.has_identity(identity))
    }

    pub fn is_bot(&self, identity: &str) -> bool {
        self.resolve(identity).is_some()
    }

    pub fn mention_targets(&self) -> Vec<MentionTarget> {
        self.bots
            .iter()
            .map(|profile| MentionTarget::new(profile.name.clone(), profile.number.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

impl IdentityDirectory for BotRoster {
    fn display_name(&self, identity: &str) -> Option<String> {
        self.resolve(identity).map(|profile| profile.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, number: &str, uuid: Option<&str>) -> BotProfile {
        BotProfile {
            name: name.to_string(),
            number: number.to_string(),
            uuid: uuid.map(ToOwned::to_owned),
            agent_id: format!("agent-{name}"),
        }
    }

    #[test]
    fn resolves_by_number_or_uuid() {
        let roster = BotRoster::new(vec![
            profile("Scout", "+15550001", Some("AAAA-uuid")),
            profile("Sage", "+15550002", None),
        ])
        .expect("valid roster");
        assert_eq!(roster.resolve("+15550002").map(|b| b.name.as_str()), Some("Sage"));
        assert_eq!(roster.resolve("aaaa-UUID").map(|b| b.name.as_str()), Some("Scout"));
        assert!(roster.resolve("").is_none());
        assert!(!roster.is_bot("+15559999"));
        assert_eq!(roster.display_name("+15550001").as_deref(), Some("Scout"));
    }

    #[test]
    fn rejects_duplicates() {
        let err = BotRoster::new(vec![
            profile("Scout", "+1", None),
            profile("scout", "+2", None),
        ])
        .expect_err("duplicate names");
        assert!(err.to_string().contains("duplicate bot name"));

        assert!(BotRoster::new(vec![profile("A", "+1", None), profile("B", "+1", None)]).is_err());
        assert!(BotRoster::new(Vec::new()).is_err());
    }
}
