//! Read-only access to the lending ledger.

use std::time::Instant;

use alloy_primitives::U256;
use alloy_sol_types::SolCall;
use chrono::Utc;
use rust_decimal::Decimal;

use lendo_core::{
    from_wei, Address, LedgerSnapshot, LendoError, LendoResult, LoanRecord, ProviderFault,
};

use crate::abi::LendingPool;
use crate::gateway::WalletGateway;

#[derive(Clone)]
pub struct LedgerReader {
    gateway: WalletGateway,
    contract: Address,
}

impl LedgerReader {
    pub fn new(gateway: WalletGateway, contract: Address) -> Self {
        Self { gateway, contract }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Issue a read-only call. `name` identifies the call in errors.
    async fn call<C: SolCall>(&self, name: &'static str, call: C) -> LendoResult<C::Return> {
        let provider = self.gateway.provider()?;
        let data = provider
            .call(self.contract, call.abi_encode().into())
            .await
            .map_err(|fault| LendoError::remote_read(name, fault))?;
        C::abi_decode_returns(&data, true)
            .map_err(|e| LendoError::remote_read(name, ProviderFault::Decode(e.to_string())))
    }

    fn amount(name: &'static str, wei: U256) -> LendoResult<Decimal> {
        from_wei(wei).map_err(|e| LendoError::remote_read(name, ProviderFault::Decode(e.to_string())))
    }

    /// Total balance held by the contract.
    pub async fn get_pool_balance(&self) -> LendoResult<Decimal> {
        let name = "getContractBalance";
        let balance = self.call(name, LendingPool::getContractBalanceCall {}).await?;
        Self::amount(name, balance._0)
    }

    pub async fn get_lender_balance(&self, identity: Address) -> LendoResult<Decimal> {
        let name = "lenderBalances";
        let balance = self
            .call(name, LendingPool::lenderBalancesCall { lender: identity })
            .await?;
        Self::amount(name, balance._0)
    }

    /// The borrower's loan exactly as the ledger reports it, zeroed for unknown borrowers.
    pub async fn get_loan(&self, identity: Address) -> LendoResult<LoanRecord> {
        let name = "borrowerLoans";
        let loan = self
            .call(name, LendingPool::borrowerLoansCall { borrower: identity })
            .await?;
        Ok(LoanRecord {
            collateral_amount: Self::amount(name, loan.collateralAmount)?,
            loan_amount: Self::amount(name, loan.loanAmount)?,
            is_repaid: loan.isRepaid,
        })
    }

    /// Interest rate in basis points.
    pub async fn get_interest_rate(&self) -> LendoResult<u64> {
        let name = "interestRate";
        let raw = self.call(name, LendingPool::interestRateCall {}).await?._0;
        if raw > U256::from(u64::MAX) {
            return Err(LendoError::remote_read(
                name,
                ProviderFault::Decode(format!("interest rate {raw} out of range")),
            ));
        }
        Ok(raw.to::<u64>())
    }

    /// All four reads, issued concurrently. Fields may come from different blocks.
    pub async fn fetch_snapshot(&self, identity: Address) -> LendoResult<LedgerSnapshot> {
        let start = Instant::now();

        let (pool_balance, lender_balance, loan, interest_rate_bps) = futures::try_join!(
            self.get_pool_balance(),
            self.get_lender_balance(identity),
            self.get_loan(identity),
            self.get_interest_rate(),
        )?;

        tracing::debug!(
            wallet = %identity,
            pool_balance = %pool_balance,
            lender_balance = %lender_balance,
            duration_ms = %start.elapsed().as_millis(),
            "Ledger snapshot fetched"
        );

        Ok(LedgerSnapshot {
            pool_balance,
            lender_balance,
            loan: (!loan.is_empty()).then_some(loan),
            interest_rate_bps,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationCenter;
    use crate::provider::testing::{MockLoan, MockProvider};
    use crate::provider::WalletProvider;
    use lendo_core::{to_wei, LoanStatus};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    const ALICE: Address = Address::repeat_byte(0x11);

    fn reader_with(provider: &MockProvider) -> LedgerReader {
        let provider: Arc<dyn WalletProvider> = Arc::new(provider.clone());
        let gateway = WalletGateway::new(
            Some(provider),
            NotificationCenter::new(Duration::from_secs(5)),
        );
        LedgerReader::new(gateway, Address::ZERO)
    }

    #[tokio::test]
    async fn test_snapshot_without_loan() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_pool_balance(to_wei(dec!(12.5)).unwrap());
        let reader = reader_with(&provider);

        let snapshot = reader.fetch_snapshot(ALICE).await.unwrap();
        assert_eq!(snapshot.pool_balance, dec!(12.5));
        assert_eq!(snapshot.lender_balance, Decimal::ZERO);
        assert_eq!(snapshot.loan, None);
        assert_eq!(snapshot.interest_rate_bps, 500);
        assert_eq!(snapshot.interest_rate_percent(), dec!(5));
        assert_eq!(provider.snapshot_reads(), 1);
    }

    #[tokio::test]
    async fn test_get_loan() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_loan(
            ALICE,
            MockLoan {
                collateral: to_wei(dec!(1)).unwrap(),
                loan: to_wei(dec!(0.5)).unwrap(),
                is_repaid: false,
            },
        );
        let reader = reader_with(&provider);

        let loan = reader.get_loan(ALICE).await.unwrap();
        assert_eq!(loan.collateral_amount, dec!(1));
        assert_eq!(loan.loan_amount, dec!(0.5));
        assert_eq!(loan.status(), LoanStatus::Active);

        let snapshot = reader.fetch_snapshot(ALICE).await.unwrap();
        assert_eq!(snapshot.loan, Some(loan));
    }

    #[tokio::test]
    async fn test_read_failure_keeps_source() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_fail_reads(true);
        let reader = reader_with(&provider);

        let err = reader.get_interest_rate().await.unwrap_err();
        assert_eq!(
            err,
            LendoError::RemoteRead {
                call: "interestRate",
                source: ProviderFault::Transport("connection refused".into()),
            }
        );
        assert!(reader.fetch_snapshot(ALICE).await.is_err());
    }

    #[tokio::test]
    async fn test_read_without_provider() {
        let gateway = WalletGateway::new(None, NotificationCenter::new(Duration::from_secs(5)));
        let reader = LedgerReader::new(gateway, Address::ZERO);
        assert_eq!(reader.get_pool_balance().await, Err(LendoError::ProviderAbsent));
    }
}
