use percolator_risk::{NoOpMatcher, RiskEngine, RiskParams};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

fn default_params() -> RiskParams {
    RiskParams {
        maintenance_margin_bps: 500,
        initial_margin_bps: 1000,
        trading_fee_bps: 10,
        max_accounts: 64,
        new_account_fee: 10,
        maintenance_fee_per_slot: 1,
        liquidation_fee_bps: 50,
        liquidation_fee_cap: 1000,
    }
}

#[test]
fn deterministic_fuzz_simulation() {
    let seed = [0xabu8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let mut engine = RiskEngine::new(default_params()).unwrap();

    let mut users: Vec<u16> = Vec::new();
    let mut lps: Vec<u16> = Vec::new();

    for i in 0..2_000 {
        let op: u8 = rng.gen_range(0..9);
        let slot = (i / 10) as u64; // advance slowly
        let price: u64 = (100_000_000 + rng.gen_range(0..20_000_000)) - 10_000_000; // 100 +/- 10

        match op {
            0 => {
                if let Ok(idx) = engine.add_user(rng.gen_range(10..1_000)) {
                    users.push(idx);
                }
            }
            1 => {
                if let Ok(idx) = engine.add_lp([7; 32], [9; 32], rng.gen_range(10..1_000)) {
                    lps.push(idx);
                }
            }
            2 => {
                let pool = if rng.gen_bool(0.5) { &users } else { &lps };
                if !pool.is_empty() {
                    let idx = pool[rng.gen_range(0..pool.len())];
                    let amt = rng.gen_range(1_000..1_000_000);
                    let _ = engine.deposit(idx, amt, slot);
                }
            }
            3 => {
                if !users.is_empty() && !lps.is_empty() {
                    let u = users[rng.gen_range(0..users.len())];
                    let l = lps[rng.gen_range(0..lps.len())];
                    let size = rng.gen_range(-10_000..10_000);
                    let _ = engine.execute_trade(&NoOpMatcher, l, u, slot, price, size);
                }
            }
            4 => {
                let rate = rng.gen_range(-5..=5);
                let _ = engine.keeper_crank(slot, price, rate);
            }
            5 => {
                if !users.is_empty() {
                    let u = users[rng.gen_range(0..users.len())];
                    let amt = rng.gen_range(1..10_000);
                    let _ = engine.withdraw(u, amt, slot, price);
                }
            }
            6 => {
                if !users.is_empty() {
                    let pos = rng.gen_range(0..users.len());
                    if engine.close_account(users[pos], slot, price).is_ok() {
                        users.swap_remove(pos);
                    }
                }
            }
            7 => {
                if users.len() > 1 {
                    let batch: Vec<u16> = users.iter().copied().take(8).collect();
                    let _ = engine.liquidate_batch(&batch, slot, price / 2);
                }
            }
            8 => {
                let _ = engine.top_up_insurance_fund(rng.gen_range(0..1_000));
            }
            _ => {}
        }

        assert!(engine.check_conservation(), "conservation violated at step {}", i);
        let (num, den) = engine.haircut_ratio();
        assert!(num <= den, "haircut above one at step {}", i);
    }
}
