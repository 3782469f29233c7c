//! State-changing calls against the lending ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use alloy_primitives::U256;
use lendo_core::{
    to_wei, Address, LendoError, LendoResult, LoanRecord, LoanStatus, OperationKind,
    OperationRequest, ProviderFault, TxHash,
};

use crate::abi::write_call_data;
use crate::gateway::WalletGateway;
use crate::provider::{TransactionRequest, TxOutcome};

/// Reason reported when the ledger reverts without one.
pub const DEFAULT_REVERT_REASON: &str = "execution reverted";

pub const INVALID_AMOUNT: &str = "Please enter a valid amount";
pub const NOT_CONNECTED: &str = "Wallet is not connected";

/// A broadcast transaction awaiting inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub tx_hash: TxHash,
    pub kind: OperationKind,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LedgerWriter {
    gateway: WalletGateway,
    contract: Address,
}

impl LedgerWriter {
    pub fn new(gateway: WalletGateway, contract: Address) -> Self {
        Self { gateway, contract }
    }

    /// Check a request before anything touches the network.
    ///
    /// `loan` is the borrower's loan from the latest snapshot.
    pub fn validate(request: &OperationRequest, loan: Option<&LoanRecord>) -> LendoResult<()> {
        Self::checked_value(request.kind, request.amount)?;
        if request.kind.carries_amount() {
            return Ok(());
        }

        match loan.map(LoanRecord::status).unwrap_or(LoanStatus::NoLoan) {
            LoanStatus::NoLoan => Err(LendoError::Validation("No collateral to withdraw".into())),
            LoanStatus::Active => Err(LendoError::Validation(
                "Loan must be repaid before withdrawing collateral".into(),
            )),
            LoanStatus::Repaid => Ok(()),
        }
    }

    /// The transaction value for an operation, after checking its amount.
    fn checked_value(kind: OperationKind, amount: Option<Decimal>) -> LendoResult<U256> {
        if kind.carries_amount() {
            let amount = amount
                .filter(|amount| *amount > Decimal::ZERO)
                .ok_or_else(|| LendoError::Validation(INVALID_AMOUNT.into()))?;
            return Ok(to_wei(amount)?);
        }
        match amount {
            Some(_) => Err(LendoError::Validation(
                "Collateral withdrawal does not take an amount".into(),
            )),
            None => Ok(U256::ZERO),
        }
    }

    /// Have the wallet sign and broadcast the operation.
    ///
    /// Checks the amount and the connection before anything is sent. Loan
    /// preconditions depend on the latest snapshot and are left to [`validate`](Self::validate).
    pub async fn submit(&self, kind: OperationKind, amount: Option<Decimal>) -> LendoResult<PendingHandle> {
        let value = Self::checked_value(kind, amount)?;
        let from = self
            .gateway
            .current_identity()
            .ok_or_else(|| LendoError::Validation(NOT_CONNECTED.into()))?;
        let provider = self.gateway.provider()?;

        tracing::info!(
            wallet = %from,
            operation = %kind,
            value_wei = %value,
            "Submitting transaction"
        );

        let tx = TransactionRequest {
            from,
            to: self.contract,
            value,
            data: write_call_data(kind),
        };
        let tx_hash = provider.send_transaction(tx).await.map_err(submission_error)?;

        Ok(PendingHandle {
            tx_hash,
            kind,
            submitted_at: Utc::now(),
        })
    }

    /// Wait for the transaction to be included. Returns the block number.
    pub async fn await_confirmation(&self, handle: &PendingHandle) -> LendoResult<u64> {
        let provider = self.gateway.provider()?;
        match provider.wait_for_confirmation(handle.tx_hash).await {
            Ok(TxOutcome::Confirmed { block_number }) => {
                let elapsed = Utc::now() - handle.submitted_at;
                tracing::info!(
                    tx_hash = %handle.tx_hash,
                    operation = %handle.kind,
                    block = block_number,
                    duration_ms = elapsed.num_milliseconds(),
                    "Transaction confirmed"
                );
                Ok(block_number)
            }
            Ok(TxOutcome::Reverted { reason }) => Err(reverted(reason)),
            Err(fault) => Err(submission_error(fault)),
        }
    }
}

fn reverted(reason: Option<String>) -> LendoError {
    LendoError::ExecutionReverted(reason.unwrap_or_else(|| DEFAULT_REVERT_REASON.to_string()))
}

pub(crate) fn submission_error(fault: ProviderFault) -> LendoError {
    match fault {
        ProviderFault::Rejected => LendoError::SigningRejected,
        ProviderFault::Reverted { reason } => reverted(reason),
        other => LendoError::Submission(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationCenter;
    use crate::provider::testing::{MockLoan, MockProvider};
    use crate::provider::WalletProvider;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    const ALICE: Address = Address::repeat_byte(0x11);

    async fn connected_writer(provider: &MockProvider) -> LedgerWriter {
        let dyn_provider: Arc<dyn WalletProvider> = Arc::new(provider.clone());
        let gateway = WalletGateway::new(
            Some(dyn_provider),
            NotificationCenter::new(Duration::from_secs(5)),
        );
        gateway.connect().await.unwrap();
        LedgerWriter::new(gateway, Address::ZERO)
    }

    fn loan(is_repaid: bool) -> LoanRecord {
        LoanRecord {
            collateral_amount: dec!(1),
            loan_amount: dec!(0.5),
            is_repaid,
        }
    }

    #[test]
    fn test_validate_amounts() {
        assert!(LedgerWriter::validate(&OperationRequest::deposit(dec!(0.1)), None).is_ok());
        assert_eq!(
            LedgerWriter::validate(&OperationRequest::deposit(dec!(0)), None),
            Err(LendoError::Validation(INVALID_AMOUNT.into()))
        );
        let missing = OperationRequest {
            kind: OperationKind::Repay,
            amount: None,
        };
        assert!(LedgerWriter::validate(&missing, None).is_err());

        let too_precise = OperationRequest::borrow(dec!(0.0000000000000000001));
        let err = LedgerWriter::validate(&too_precise, None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_withdrawal() {
        let request = OperationRequest::withdraw_collateral();
        assert!(LedgerWriter::validate(&request, None).is_err());
        assert_eq!(
            LedgerWriter::validate(&request, Some(&loan(false))),
            Err(LendoError::Validation(
                "Loan must be repaid before withdrawing collateral".into()
            ))
        );
        assert!(LedgerWriter::validate(&request, Some(&loan(true))).is_ok());
    }

    #[tokio::test]
    async fn test_submit_and_confirm() {
        let provider = MockProvider::new(vec![ALICE]);
        let writer = connected_writer(&provider).await;

        let handle = writer
            .submit(OperationKind::Deposit, Some(dec!(1.5)))
            .await
            .unwrap();
        assert_eq!(handle.kind, OperationKind::Deposit);
        let sent = provider.sent_transactions();
        assert_eq!(sent[0].value, to_wei(dec!(1.5)).unwrap());

        assert_eq!(writer.await_confirmation(&handle).await, Ok(1));
        assert_eq!(provider.ledger().lenders[&ALICE], to_wei(dec!(1.5)).unwrap());
    }

    #[tokio::test]
    async fn test_submit_checks_amount() {
        let provider = MockProvider::new(vec![ALICE]);
        let writer = connected_writer(&provider).await;

        assert_eq!(
            writer.submit(OperationKind::Deposit, Some(dec!(0))).await,
            Err(LendoError::Validation(INVALID_AMOUNT.into()))
        );
        assert_eq!(
            writer.submit(OperationKind::Repay, None).await,
            Err(LendoError::Validation(INVALID_AMOUNT.into()))
        );
        assert!(writer
            .submit(OperationKind::WithdrawCollateral, Some(dec!(1)))
            .await
            .is_err());
        assert!(provider.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_signing_rejected() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_reject_signing(true);
        let writer = connected_writer(&provider).await;
        assert_eq!(
            writer.submit(OperationKind::Deposit, Some(dec!(1))).await,
            Err(LendoError::SigningRejected)
        );
    }

    #[tokio::test]
    async fn test_revert_reason_passes_through() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_loan(
            ALICE,
            MockLoan {
                collateral: to_wei(dec!(2)).unwrap(),
                loan: to_wei(dec!(1)).unwrap(),
                is_repaid: false,
            },
        );
        let writer = connected_writer(&provider).await;

        let handle = writer.submit(OperationKind::Repay, Some(dec!(0.5))).await.unwrap();
        assert_eq!(
            writer.await_confirmation(&handle).await,
            Err(LendoError::ExecutionReverted("Insufficient repayment amount".into()))
        );
    }

    #[tokio::test]
    async fn test_revert_at_broadcast() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_preflight(true);
        let writer = connected_writer(&provider).await;
        assert_eq!(
            writer.submit(OperationKind::WithdrawCollateral, None).await,
            Err(LendoError::ExecutionReverted("No loan found".into()))
        );
    }

    #[test]
    fn test_default_revert_reason() {
        assert_eq!(
            submission_error(ProviderFault::Reverted { reason: None }),
            LendoError::ExecutionReverted(DEFAULT_REVERT_REASON.into())
        );
        assert!(matches!(
            submission_error(ProviderFault::Transport("timeout".into())),
            LendoError::Submission(_)
        ));
    }
}
