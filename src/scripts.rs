//! The three server-side scripts that make balance arithmetic atomic.
//!
//! Each script is one atomic unit on the hot store: it may touch several
//! keys but observes no interleaving with other scripts. That single-file
//! execution is the only mutual exclusion the ledger relies on; no lock is
//! taken anywhere else on the hot path.
//!
//! Reply shapes are stable so the adapters can decode typed tuples:
//! reserve and deduct reply `{flag, amount, code}`; finalize replies
//! `{flag, refund, balance, consumed, code}` where `code` is empty on a
//! fresh transition and `ALREADY_FINALIZED` on an idempotent replay.

/// KEYS: balance, reserved, request. ARGV: reserved_grains,
/// estimated_grains, now_epoch, metadata_json, customer_id, ttl_secs.
///
/// Admits the reservation only when `balance - reserved >= needed`, so
/// concurrent requests can never collectively overbook a customer. A
/// request id that still has a tracking record (in flight, or finalized
/// and inside the retention window) is rejected as REQUEST_EXISTS.
pub const CHECK_AND_RESERVE: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local reserved = tonumber(redis.call('GET', KEYS[2]) or '0')
local needed = tonumber(ARGV[1])
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {0, balance, 'REQUEST_EXISTS'}
end
local available = balance - reserved
if available < needed then
  return {0, balance, 'INSUFFICIENT_BALANCE'}
end
redis.call('INCRBY', KEYS[2], needed)
redis.call('HSET', KEYS[3],
  'customer_id', ARGV[5],
  'reserved_grains', ARGV[1],
  'estimated_grains', ARGV[2],
  'consumed_grains', '0',
  'tokens_consumed', '0',
  'status', 'preflight_approved',
  'created_at', ARGV[3],
  'metadata', ARGV[4])
redis.call('EXPIRE', KEYS[3], tonumber(ARGV[6]))
return {1, available - needed, ''}
"#;

/// KEYS: balance, request. ARGV: grain_amount, tokens_consumed, now_epoch.
///
/// Debits the balance as the provider stream is read. Does NOT decrement
/// `reserved`: spent grains keep counting against the reservation until
/// finalization, so a new reservation from the same customer cannot slip
/// under an in-flight one. Any failure here is the kill switch.
pub const DEDUCT_GRAINS: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if redis.call('EXISTS', KEYS[2]) == 0 then
  return {0, balance, 'REQUEST_NOT_FOUND'}
end
if balance < amount then
  return {0, balance, 'INSUFFICIENT_BALANCE'}
end
if balance - amount < 0 then
  return {0, balance, 'BALANCE_NEGATIVE'}
end
redis.call('DECRBY', KEYS[1], amount)
redis.call('HINCRBY', KEYS[2], 'consumed_grains', amount)
redis.call('HINCRBY', KEYS[2], 'tokens_consumed', tonumber(ARGV[2]))
redis.call('HSET', KEYS[2], 'status', 'streaming', 'last_deduction_at', ARGV[3])
return {1, balance - amount, ''}
"#;

/// KEYS: balance, reserved, request. ARGV: actual_cost_grains,
/// terminal_status, now_epoch, ttl_secs.
///
/// Reconciles streamed deductions against the provider's authoritative
/// cost, releases the reservation, and stamps the terminal state. A request
/// already in a terminal state replies success unchanged, which is what
/// makes client retries after timeouts safe.
pub const FINALIZE_REQUEST: &str = r#"
local request = redis.call('HGETALL', KEYS[3])
if #request == 0 then
  return {0, 0, 0, 0, 'REQUEST_NOT_FOUND'}
end
local fields = {}
for i = 1, #request, 2 do
  fields[request[i]] = request[i + 1]
end
local status = fields['status']
if status == 'completed' or status == 'killed' or status == 'failed' or status == 'timeout' then
  local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
  local consumed = tonumber(fields['consumed_grains'] or '0')
  return {1, 0, balance, consumed, 'ALREADY_FINALIZED'}
end
local reserved = tonumber(fields['reserved_grains'] or '0')
local consumed = tonumber(fields['consumed_grains'] or '0')
local actual = tonumber(ARGV[1])
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local refund = 0
if consumed > actual then
  refund = consumed - actual
  redis.call('INCRBY', KEYS[1], refund)
  balance = balance + refund
elseif actual > consumed then
  local extra = actual - consumed
  if balance >= extra then
    redis.call('DECRBY', KEYS[1], extra)
    balance = balance - extra
    refund = -extra
  else
    redis.call('SET', KEYS[1], '0')
    refund = -balance
    balance = 0
    redis.call('HSET', KEYS[3], 'integrity_issue', 'undercharge_shortfall')
  end
end
local held = tonumber(redis.call('GET', KEYS[2]) or '0')
if held >= reserved then
  redis.call('DECRBY', KEYS[2], reserved)
else
  redis.call('SET', KEYS[2], '0')
  redis.call('HSET', KEYS[3], 'integrity_issue', 'reservation_underflow')
end
redis.call('HSET', KEYS[3],
  'status', ARGV[2],
  'actual_cost_grains', ARGV[1],
  'refunded_grains', tostring(refund),
  'finalized_at', ARGV[3])
redis.call('EXPIRE', KEYS[3], tonumber(ARGV[4]))
return {1, refund, balance, consumed, ''}
"#;
