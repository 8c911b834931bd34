//! Kani harnesses for the risk engine core.
//!
//! Run with: `cargo kani --tests`
//!
//! Proven properties:
//! - haircut ratio stays within [0, 1] and never inflates a claim
//! - matcher validation never accepts a fill larger than requested
//! - loss settlement never touches positive PnL and keeps capital_total in step
//! - a rejected liquidation leaves account and globals unchanged

#![cfg(kani)]

extern crate kani;

use percolator_risk::haircut::effective_positive_pnl;
use percolator_risk::ledger::settle_losses;
use percolator_risk::*;

fn params() -> RiskParams {
    RiskParams {
        maintenance_margin_bps: 500,
        initial_margin_bps: 1000,
        trading_fee_bps: 10,
        max_accounts: 4,
        new_account_fee: 0,
        maintenance_fee_per_slot: 0,
        liquidation_fee_bps: 100,
        liquidation_fee_cap: 0,
    }
}

#[kani::proof]
fn haircut_ratio_bounded() {
    let mut g = GlobalState::new();
    g.vault_balance = kani::any::<u32>() as u128;
    g.capital_total = kani::any::<u32>() as u128;
    g.insurance_fund = kani::any::<u32>() as u128;
    g.pnl_positive_total = kani::any::<u32>() as u128;

    let (num, den) = get_haircut_ratio(&g);
    assert!(den > 0);
    assert!(num <= den);

    let claim: u32 = kani::any();
    assert!(effective_positive_pnl(claim as i128, (num, den)) <= claim as u128);
}

#[kani::proof]
fn matcher_fill_never_exceeds_request() {
    let result = MatchResult {
        flags: kani::any(),
        exec_price: kani::any(),
        exec_size: kani::any::<i64>() as i128,
    };
    let requested = kani::any::<i64>() as i128;

    if let Ok(Some(fill)) = validate_match_result(&result, requested) {
        assert!(fill.exec_size().unsigned_abs() <= requested.unsigned_abs());
        assert!(fill.exec_size().signum() == requested.signum());
        assert!(fill.exec_price() > 0 && fill.exec_price() <= MAX_ORACLE_PRICE);
    }
}

#[kani::proof]
fn settle_losses_keeps_aggregates() {
    let mut g = GlobalState::new();
    let mut a = TradingAccount::new(AccountKind::User, 0);
    let capital = kani::any::<u32>() as u128;
    let pnl = kani::any::<i32>() as i128;
    g.set_capital(&mut a, capital).unwrap();
    g.set_pnl(&mut a, pnl).unwrap();

    let written_off = settle_losses(&mut a, &mut g).unwrap();

    assert!(a.realized_pnl >= 0);
    assert!(g.capital_total == a.capital);
    if pnl >= 0 {
        assert!(a.realized_pnl == pnl && a.capital == capital && written_off == 0);
    } else {
        assert!(capital - a.capital + written_off == pnl.unsigned_abs());
    }
}

#[kani::proof]
fn rejected_liquidation_is_a_no_op() {
    let mut g = GlobalState::new();
    let f = FundingState::new(0);
    let mut a = TradingAccount::new(AccountKind::User, 0);
    a.entry_price = 1_000_000;
    g.set_capital(&mut a, kani::any::<u16>() as u128).unwrap();
    g.vault_balance = a.capital;
    g.set_position(&mut a, kani::any::<i16>() as i128).unwrap();
    let price: u32 = kani::any();
    kani::assume(price > 0);

    let before = (a, g);
    if liquidate_position(&mut a, price as u64, &f, &mut g, &params()).is_err() {
        assert!((a, g) == before);
    }
}

#[kani::proof]
fn risk_increasing_detects_flips() {
    let old: i64 = kani::any();
    let new: i64 = kani::any();
    let (old, new) = (old as i128, new as i128);
    if old != 0 && new != 0 && old.signum() != new.signum() {
        assert!(is_risk_increasing(old, new));
    }
    if new.unsigned_abs() <= old.unsigned_abs() && (new == 0 || new.signum() == old.signum()) {
        assert!(!is_risk_increasing(old, new));
    }
}
