//! Bindings for the lending contract's interface.

use alloy_primitives::Bytes;
use alloy_sol_types::{sol, Panic, Revert, SolCall, SolError, SolInterface};

use lendo_core::OperationKind;

pub use self::LendingPool::LendingPoolCalls;

sol! {
    interface LendingPool {
        function deposit() external payable;
        function borrow() external payable;
        function repay() external payable;
        function withdrawCollateral() external;

        function getContractBalance() external view returns (uint256);
        function lenderBalances(address lender) external view returns (uint256);
        function borrowerLoans(address borrower)
            external
            view
            returns (uint256 collateralAmount, uint256 loanAmount, bool isRepaid);
        function interestRate() external view returns (uint256);
    }
}

/// Call data for a state-changing operation. None of them take arguments;
/// the amount travels as the transaction value.
pub fn write_call_data(kind: OperationKind) -> Bytes {
    let data = match kind {
        OperationKind::Deposit => LendingPool::depositCall {}.abi_encode(),
        OperationKind::Borrow => LendingPool::borrowCall {}.abi_encode(),
        OperationKind::Repay => LendingPool::repayCall {}.abi_encode(),
        OperationKind::WithdrawCollateral => LendingPool::withdrawCollateralCall {}.abi_encode(),
    };
    Bytes::from(data)
}

/// Recognize which write operation some call data encodes.
pub fn decode_write_call(data: &[u8]) -> Option<OperationKind> {
    match LendingPoolCalls::abi_decode(data, true).ok()? {
        LendingPoolCalls::deposit(_) => Some(OperationKind::Deposit),
        LendingPoolCalls::borrow(_) => Some(OperationKind::Borrow),
        LendingPoolCalls::repay(_) => Some(OperationKind::Repay),
        LendingPoolCalls::withdrawCollateral(_) => Some(OperationKind::WithdrawCollateral),
        _ => None,
    }
}

/// Extract a human-readable reason from revert data, if it carries one.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if let Ok(revert) = Revert::abi_decode(data, true) {
        return Some(revert.reason);
    }
    Panic::abi_decode(data, true)
        .ok()
        .map(|panic| format!("panic code 0x{:x}", panic.code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    #[test]
    fn test_known_selectors() {
        assert_eq!(LendingPool::depositCall::SELECTOR, [0xd0, 0xe3, 0x0d, 0xb0]);
        assert_eq!(Revert::SELECTOR, [0x08, 0xc3, 0x79, 0xa0]);
        assert_eq!(Panic::SELECTOR, [0x4e, 0x48, 0x7b, 0x71]);
    }

    #[test]
    fn test_read_call_roundtrip() {
        let who = Address::repeat_byte(0xab);
        let data = LendingPool::lenderBalancesCall { lender: who }.abi_encode();
        assert_eq!(data.len(), 4 + 32);
        let LendingPoolCalls::lenderBalances(call) = LendingPoolCalls::abi_decode(&data, true).unwrap()
        else {
            panic!("expected a lenderBalances call");
        };
        assert_eq!(call.lender, who);
    }

    #[test]
    fn test_decode_write_call() {
        for kind in OperationKind::ALL {
            assert_eq!(decode_write_call(&write_call_data(kind)), Some(kind));
        }
        assert_eq!(decode_write_call(&[0xde, 0xad]), None);
        let read = LendingPool::interestRateCall {}.abi_encode();
        assert_eq!(decode_write_call(&read), None);
    }

    #[test]
    fn test_decode_loan() {
        let one = U256::from(10u64).pow(U256::from(18u8));
        let half = one / U256::from(2u8);
        let data = LendingPool::borrowerLoansCall::abi_encode_returns(&(one, half, true));
        let loan = LendingPool::borrowerLoansCall::abi_decode_returns(&data, true).unwrap();
        assert_eq!(loan.collateralAmount, one);
        assert_eq!(loan.loanAmount, half);
        assert!(loan.isRepaid);
    }

    #[test]
    fn test_short_return_data() {
        assert!(LendingPool::getContractBalanceCall::abi_decode_returns(&[0u8; 8], true).is_err());
        assert!(LendingPool::borrowerLoansCall::abi_decode_returns(&[0u8; 64], true).is_err());
    }

    #[test]
    fn test_revert_reason() {
        let data = Revert {
            reason: "Insufficient repayment amount".into(),
        }
        .abi_encode();
        assert_eq!(
            decode_revert_reason(&data).as_deref(),
            Some("Insufficient repayment amount")
        );
        assert_eq!(decode_revert_reason(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_panic_reason() {
        let data = Panic {
            code: U256::from(0x11u8),
        }
        .abi_encode();
        assert_eq!(decode_revert_reason(&data).as_deref(), Some("panic code 0x11"));
    }
}
