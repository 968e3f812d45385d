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

//! Request validation.
//!
//! Turns a raw [`Request`] into an [`Intent`] the engine can execute. This is
//! a pure function: nothing here touches the store.

use crate::base::{OperationId, OrderId, OrderRef, ServiceId, UserId};
use crate::error::LedgerError;
use crate::journal::EntryKind;
use crate::money::{MinorUnits, to_minor};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Operation requested at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Income,
    CreateOrder,
    FinishOrder,
    CancelOrder,
}

impl RequestKind {
    /// Journal kind recorded by a successful request.
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            Self::Income => EntryKind::Transfer,
            Self::CreateOrder => EntryKind::Capture,
            Self::FinishOrder => EntryKind::WriteOff,
            Self::CancelOrder => EntryKind::Cancel,
        }
    }
}

/// Raw request as received by the boundary layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Request {
    pub operation_id: OperationId,
    pub user_id: UserId,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    /// Amount in major units.
    pub amount: Decimal,
}

impl Request {
    pub fn income(operation_id: OperationId, user_id: UserId, amount: Decimal) -> Self {
        Self {
            operation_id,
            user_id,
            service_id: None,
            order_id: None,
            amount,
        }
    }

    pub fn order(
        operation_id: OperationId,
        user_id: UserId,
        order: OrderRef,
        amount: Decimal,
    ) -> Self {
        Self {
            operation_id,
            user_id,
            service_id: Some(order.service_id),
            order_id: Some(order.order_id),
            amount,
        }
    }
}

/// Validated request, consumed once by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub operation_id: OperationId,
    pub user_id: UserId,
    pub kind: EntryKind,
    /// Absent for income.
    pub order: Option<OrderRef>,
    pub amount_major: Decimal,
    pub amount_minor: MinorUnits,
}

/// Validates `request` for the operation `kind`.
///
/// # Errors
///
/// - [`LedgerError::InvalidAmount`] - amount is not positive, is below one
///   minor unit, or does not fit in minor units.
/// - [`LedgerError::MissingField`] - order operation without service or
///   order ID.
pub fn validate(kind: RequestKind, request: &Request) -> Result<Intent, LedgerError> {
    let subject = match kind {
        RequestKind::Income => "income amount",
        _ => "total amount",
    };
    if request.amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "{subject} should be greater than 0"
        )));
    }
    let amount_minor = match to_minor(request.amount) {
        Some(minor) if minor > 0 => minor,
        Some(_) => {
            return Err(LedgerError::InvalidAmount(format!(
                "{subject} is smaller than one minor unit"
            )));
        }
        None => {
            return Err(LedgerError::InvalidAmount(format!(
                "{subject} is out of range"
            )));
        }
    };

    let order = match kind {
        RequestKind::Income => None,
        _ => {
            let service_id = request
                .service_id
                .ok_or(LedgerError::MissingField("service_id"))?;
            let order_id = request
                .order_id
                .ok_or(LedgerError::MissingField("order_id"))?;
            Some(OrderRef::new(service_id, order_id))
        }
    };

    Ok(Intent {
        operation_id: request.operation_id,
        user_id: request.user_id,
        kind: kind.entry_kind(),
        order,
        amount_major: request.amount,
        amount_minor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> OrderRef {
        OrderRef::new(ServiceId(2), OrderId(3))
    }

    #[test]
    fn income_is_tagged_transfer() {
        let request = Request::income(OperationId(1), UserId(1), dec!(10.00));
        let intent = validate(RequestKind::Income, &request).unwrap();
        assert_eq!(intent.kind, EntryKind::Transfer);
        assert_eq!(intent.amount_minor, 1000);
        assert_eq!(intent.order, None);
    }

    #[test]
    fn order_requests_are_tagged_by_operation() {
        let request = Request::order(OperationId(1), UserId(1), order(), dec!(4.00));
        let cases = [
            (RequestKind::CreateOrder, EntryKind::Capture),
            (RequestKind::FinishOrder, EntryKind::WriteOff),
            (RequestKind::CancelOrder, EntryKind::Cancel),
        ];
        for (kind, expected) in cases {
            let intent = validate(kind, &request).unwrap();
            assert_eq!(intent.kind, expected);
            assert_eq!(intent.order, Some(order()));
            assert_eq!(intent.amount_minor, 400);
        }
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        for amount in [dec!(0), dec!(-5)] {
            let request = Request::income(OperationId(1), UserId(1), amount);
            assert_eq!(
                validate(RequestKind::Income, &request),
                Err(LedgerError::InvalidAmount(
                    "income amount should be greater than 0".into()
                ))
            );
        }
    }

    #[test]
    fn sub_minor_amount_is_rejected() {
        let request = Request::order(OperationId(1), UserId(1), order(), dec!(0.009));
        assert!(matches!(
            validate(RequestKind::CreateOrder, &request),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn fractional_minor_units_are_truncated() {
        let request = Request::income(OperationId(1), UserId(1), dec!(1.239));
        let intent = validate(RequestKind::Income, &request).unwrap();
        assert_eq!(intent.amount_minor, 123);
        assert_eq!(intent.amount_major, dec!(1.239));
    }

    #[test]
    fn order_request_without_order_is_rejected() {
        let request = Request::income(OperationId(1), UserId(1), dec!(1));
        assert_eq!(
            validate(RequestKind::FinishOrder, &request),
            Err(LedgerError::MissingField("service_id"))
        );

        let request = Request {
            service_id: Some(ServiceId(1)),
            ..request
        };
        assert_eq!(
            validate(RequestKind::CancelOrder, &request),
            Err(LedgerError::MissingField("order_id"))
        );
    }

    #[test]
    fn request_deserializes_without_order_fields() {
        let request: Request =
            serde_json::from_str(r#"{"operation_id": 1, "user_id": 5, "amount": "2.50"}"#)
                .unwrap();
        assert_eq!(request.service_id, None);
        assert_eq!(request.amount, dec!(2.50));
    }
}
