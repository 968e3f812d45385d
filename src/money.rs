// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Conversion between display amounts and ledger minor units.
//!
//! Ledger state is always an integer count of minor units (cents). Decimal
//! major-unit amounts only exist at the edges: parsed from requests and
//! produced for display.
//!
//! # Example
//!
//! ```
//! use balance_ledger::money::{to_major, to_minor};
//! use rust_decimal_macros::dec;
//!
//! assert_eq!(to_minor(dec!(10.999)), Some(1099));
//! assert_eq!(to_major(1099), dec!(11));
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Amount expressed in minor units.
pub type MinorUnits = i64;

/// Number of minor units in one major unit.
pub const MINOR_UNITS_IN_MAJOR: i64 = 100;

/// Converts a major-unit amount to minor units, truncating toward zero.
///
/// Returns `None` when the result does not fit in [`MinorUnits`].
pub fn to_minor(amount_major: Decimal) -> Option<MinorUnits> {
    amount_major
        .checked_mul(Decimal::from(MINOR_UNITS_IN_MAJOR))?
        .trunc()
        .to_i64()
}

/// Converts minor units to a major-unit display amount.
///
/// The result is rounded to a whole major unit (half away from zero), so
/// `650` displays as `7`. Display values are never fed back into the ledger.
pub fn to_major(amount_minor: MinorUnits) -> Decimal {
    Decimal::new(amount_minor, 2).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}
