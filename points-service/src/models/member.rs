//! Member model - the custodied points account holder.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::Direction;

/// Member entity. Balance changes only through ledger mutations; members are
/// deactivated, never deleted.
#[derive(Debug, Clone, FromRow)]
pub struct Member {
    pub member_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub points_balance: Decimal,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Member {
    /// Create a new member with an empty balance.
    pub fn new(email: String, display_name: Option<String>, password_hash: String) -> Self {
        Self {
            member_id: Uuid::new_v4(),
            email,
            display_name,
            password_hash,
            points_balance: Decimal::ZERO,
            active: true,
            created_utc: Utc::now(),
        }
    }

    /// Balance after applying `amount` in `direction`, or `None` when a debit
    /// would take the balance below zero.
    pub fn balance_after(&self, direction: Direction, amount: Decimal) -> Option<Decimal> {
        match direction {
            Direction::Credit => Some(self.points_balance + amount),
            Direction::Debit if amount > self.points_balance => None,
            Direction::Debit => Some(self.points_balance - amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn member_with(balance: &str) -> Member {
        Member {
            points_balance: dec(balance),
            ..Member::new("m@example.com".to_string(), None, "hash".to_string())
        }
    }

    #[test]
    fn credit_increases_balance() {
        let member = member_with("10.00");
        assert_eq!(
            member.balance_after(Direction::Credit, dec("5.50")),
            Some(dec("15.50"))
        );
    }

    #[test]
    fn debit_up_to_balance_is_allowed() {
        let member = member_with("200");
        assert_eq!(
            member.balance_after(Direction::Debit, dec("200")),
            Some(Decimal::ZERO)
        );
    }

    #[test]
    fn debit_beyond_balance_is_refused() {
        let member = member_with("50");
        assert_eq!(member.balance_after(Direction::Debit, dec("100")), None);
    }
}
