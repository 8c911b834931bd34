//! Property tests for the haircut, trade and funding core.

use proptest::prelude::*;

use percolator_risk::funding::pending_funding_payment;
use percolator_risk::haircut::effective_positive_pnl;
use percolator_risk::ledger::deposit_capital;
use percolator_risk::*;

fn default_params() -> RiskParams {
    RiskParams {
        maintenance_margin_bps: 500,
        initial_margin_bps: 1000,
        trading_fee_bps: 10,
        max_accounts: 64,
        new_account_fee: 0,
        maintenance_fee_per_slot: 0,
        liquidation_fee_bps: 100,
        liquidation_fee_cap: 0,
    }
}

fn funded(kind: AccountKind, id: u64, capital: u128, price: u64, global: &mut GlobalState) -> TradingAccount {
    let mut a = TradingAccount::new(kind, id);
    a.entry_price = price;
    deposit_capital(&mut a, global, capital).unwrap();
    a
}

fn nonzero_size(max: i128) -> impl Strategy<Value = i128> {
    prop_oneof![1..=max, -max..=-1]
}

proptest! {
    #[test]
    fn haircut_ratio_is_a_fraction(
        vault in any::<u64>(),
        capital in any::<u64>(),
        insurance in any::<u64>(),
        pnl_pos in any::<u64>(),
        claim in 0i128..=i64::MAX as i128,
    ) {
        let mut g = GlobalState::new();
        g.vault_balance = vault as u128;
        g.capital_total = capital as u128;
        g.insurance_fund = insurance as u128;
        g.pnl_positive_total = pnl_pos as u128;

        let (num, den) = get_haircut_ratio(&g);
        prop_assert!(den > 0);
        prop_assert!(num <= den);
        prop_assert!(effective_positive_pnl(claim, (num, den)) <= claim as u128);
    }

    #[test]
    fn trades_are_zero_sum_before_fees(
        oracle in 1u64..=2_000_000,
        exec in 1u64..=2_000_000,
        size in nonzero_size(1_000_000),
    ) {
        let capital = 1_000_000_000_000_000u128;
        let mut g = GlobalState::new();
        let f = FundingState::new(0);
        let mut user = funded(AccountKind::User, 0, capital, oracle, &mut g);
        let mut lp = funded(AccountKind::Lp, 1, capital, oracle, &mut g);

        let fill = validate_match_result(&MatchResult::filled(exec, size), size).unwrap().unwrap();
        let out = execute_trade(&mut user, &mut lp, fill, oracle, &f, &mut g, &default_params()).unwrap();

        let total = user.capital as i128 + lp.capital as i128 + user.realized_pnl + lp.realized_pnl;
        prop_assert_eq!(total, 2 * capital as i128 - out.fee as i128);
        prop_assert_eq!(user.position_size, -lp.position_size);
        prop_assert_eq!(g.insurance_fund, out.fee);
        prop_assert_eq!(g.vault_balance, 2 * capital);
    }

    #[test]
    fn rejected_trades_leave_no_trace(
        user_capital in 0u128..2_000,
        lp_capital in 0u128..2_000,
        size in nonzero_size(5_000),
        exec in 900_000u64..1_100_000,
    ) {
        let mut g = GlobalState::new();
        let f = FundingState::new(0);
        let mut user = funded(AccountKind::User, 0, user_capital, 1_000_000, &mut g);
        let mut lp = funded(AccountKind::Lp, 1, lp_capital, 1_000_000, &mut g);

        let before = (
            bytemuck::bytes_of(&user).to_vec(),
            bytemuck::bytes_of(&lp).to_vec(),
            bytemuck::bytes_of(&g).to_vec(),
        );
        let fill = validate_match_result(&MatchResult::filled(exec, size), size).unwrap().unwrap();
        if execute_trade(&mut user, &mut lp, fill, 1_000_000, &f, &mut g, &default_params()).is_err() {
            prop_assert_eq!(bytemuck::bytes_of(&user), &before.0[..]);
            prop_assert_eq!(bytemuck::bytes_of(&lp), &before.1[..]);
            prop_assert_eq!(bytemuck::bytes_of(&g), &before.2[..]);
        } else {
            prop_assert!(g.vault_balance >= g.capital_total + g.insurance_fund);
        }
    }

    #[test]
    fn funding_payer_never_owes_less_than_receiver_gets(
        position in nonzero_size(1_000_000_000),
        delta_f in any::<i64>(),
    ) {
        let mut f = FundingState::new(0);
        f.funding_index = delta_f as i128;

        let mut a = TradingAccount::new(AccountKind::User, 0);
        a.position_size = position;
        let mut b = TradingAccount::new(AccountKind::User, 1);
        b.position_size = -position;

        let pa = pending_funding_payment(&a, &f).unwrap();
        let pb = pending_funding_payment(&b, &f).unwrap();
        prop_assert!(pa + pb >= 0);
        prop_assert!(pa + pb <= 1);
    }

    #[test]
    fn liquidation_is_all_or_nothing(
        capital in 0u128..500,
        position in nonzero_size(10_000),
        price in 500_000u64..1_500_000,
    ) {
        let mut g = GlobalState::new();
        let f = FundingState::new(0);
        let mut a = funded(AccountKind::User, 0, capital, 1_000_000, &mut g);
        g.set_position(&mut a, position).unwrap();
        let before = (a, g);

        match liquidate_position(&mut a, price, &f, &mut g, &default_params()) {
            Ok(out) => {
                prop_assert_eq!(a.position_size, 0);
                prop_assert_eq!(out.closed_size, position);
                prop_assert!(out.equity_before <= out.mm_required);
                prop_assert!(g.vault_balance >= g.capital_total + g.insurance_fund);
            }
            Err(e) => {
                prop_assert_eq!(e, RiskError::NotLiquidatable);
                prop_assert_eq!((a, g), before);
            }
        }
    }
}

/// Every combination of boundary prices and sizes either succeeds or returns
/// a typed error; none of them may panic.
#[test]
fn extreme_inputs_never_panic() {
    let prices = [1u64, 1_000_000, MAX_ORACLE_PRICE];
    let sizes = [1i128, (MAX_POSITION_ABS / 2) as i128, MAX_POSITION_ABS as i128];
    let params = default_params();

    for &oracle in &prices {
        for &exec in &prices {
            for &size in &sizes {
                for sign in [1i128, -1] {
                    let size = size * sign;
                    let mut g = GlobalState::new();
                    let f = FundingState::new(0);
                    let mut user = funded(AccountKind::User, 0, u128::MAX / 4, exec, &mut g);
                    let mut lp = funded(AccountKind::Pool, 1, u128::MAX / 4, exec, &mut g);

                    let fill = validate_match_result(&MatchResult::filled(exec, size), size)
                        .unwrap()
                        .unwrap();
                    let _ = execute_trade(&mut user, &mut lp, fill, oracle, &f, &mut g, &params);
                    let _ = calculate_margin_equity(&user, oracle, get_haircut_ratio(&g));
                    let _ = check_margin_requirements(&user, oracle, (1, 1), 500, 1000, true);
                    let _ = liquidate_position(&mut user, oracle, &f, &mut g, &params);

                    let mut raw = TradingAccount::new(AccountKind::User, 2);
                    raw.position_size = size;
                    raw.entry_price = exec;
                    raw.realized_pnl = i128::MAX;
                    raw.capital = u128::MAX;
                    let _ = calculate_margin_equity(&raw, oracle, (u128::MAX - 1, u128::MAX));
                    let _ = calculate_mark_pnl(size, exec, oracle);
                }
            }
        }
    }
}
