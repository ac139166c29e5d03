//! Request Planner: groups a node's parameters into batched reads.
//!
//! Grounded in `original_source/app/services/modbus_line.py`'s
//! `_group_sequential`: sort by `(register_type, normalized_address)`,
//! flush a block on non-contiguity or cap overflow, isolate multi-word
//! parameters as single-transaction reads.

use crate::domain::codec::normalize_address;
use crate::domain::types::{ParamSpec, RegisterType};
use smallvec::SmallVec;

/// One planned read: either a block of contiguous single-word parameters
/// or a single parameter's own transaction (used for anything with more
/// than one word, or when batching is disabled).
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    pub members: SmallVec<[PlannedMember; 8]>,
}

#[derive(Debug, Clone)]
pub struct PlannedMember {
    pub param_index: usize,
    pub normalized_address: u16,
    pub words: usize,
}

/// A parameter rejected by the planner before any transaction is issued,
/// per SPEC_FULL.md §4.4's address-overflow boundary case.
#[derive(Debug, Clone)]
pub struct PlannerRejection {
    pub param_index: usize,
    pub reason: String,
}

pub struct Plan {
    pub reads: Vec<PlannedRead>,
    pub rejections: Vec<PlannerRejection>,
}

/// Builds a read plan for one node's parameters.
pub fn plan_node_reads(
    params: &[ParamSpec],
    normalize: bool,
    batching_enabled: bool,
    max_bits: usize,
    max_registers: usize,
) -> Plan {
    let mut rejections = Vec::new();
    let mut entries: Vec<(usize, RegisterType, u32, usize)> = Vec::with_capacity(params.len());

    for (idx, p) in params.iter().enumerate() {
        let normalized = normalize_address(p.register_type, p.address, normalize);
        let span_end = normalized as u64 + p.words as u64;
        if span_end > 65536 {
            rejections.push(PlannerRejection {
                param_index: idx,
                reason: format!(
                    "normalized address {normalized} + {} words overflows the wire address space",
                    p.words
                ),
            });
            continue;
        }
        entries.push((idx, p.register_type, normalized, p.words));
    }

    // Sort key: (register_type, normalized_address); original insertion
    // order (YAML/config order) breaks ties via a stable sort.
    entries.sort_by(|a, b| {
        let ord = type_rank(a.1).cmp(&type_rank(b.1)).then(a.2.cmp(&b.2));
        ord
    });

    let mut reads = Vec::new();
    let mut current: Option<PlannedRead> = None;

    for (idx, register_type, normalized, words) in entries {
        let cap = if register_type.is_bit() { max_bits } else { max_registers };

        let is_batchable = batching_enabled && words == 1;

        if !is_batchable {
            flush(&mut current, &mut reads);
            reads.push(PlannedRead {
                register_type,
                start: normalized as u16,
                count: words as u16,
                members: SmallVec::from_vec(vec![PlannedMember {
                    param_index: idx,
                    normalized_address: normalized as u16,
                    words,
                }]),
            });
            continue;
        }

        let fits_current = current.as_ref().is_some_and(|c| {
            c.register_type == register_type
                && c.start as u32 + c.count as u32 == normalized
                && (c.count as usize) < cap
        });

        if fits_current {
            let c = current.as_mut().unwrap();
            c.count += 1;
            c.members.push(PlannedMember { param_index: idx, normalized_address: normalized as u16, words });
        } else {
            flush(&mut current, &mut reads);
            current = Some(PlannedRead {
                register_type,
                start: normalized as u16,
                count: 1,
                members: SmallVec::from_vec(vec![PlannedMember {
                    param_index: idx,
                    normalized_address: normalized as u16,
                    words,
                }]),
            });
        }
    }
    flush(&mut current, &mut reads);

    Plan { reads, rejections }
}

fn flush(current: &mut Option<PlannedRead>, reads: &mut Vec<PlannedRead>) {
    if let Some(read) = current.take() {
        reads.push(read);
    }
}

fn type_rank(rt: RegisterType) -> u8 {
    match rt {
        RegisterType::Coil => 0,
        RegisterType::Discrete => 1,
        RegisterType::Holding => 2,
        RegisterType::Input => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DataType, ParamMode, PublishMode, WordOrder};

    fn param(name: &str, rt: RegisterType, address: u32, words: usize, data_type: DataType) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            register_type: rt,
            address,
            words,
            data_type,
            word_order: WordOrder::Ab,
            scale: 1.0,
            mode: ParamMode::R,
            publish_mode: PublishMode::OnChange,
            publish_interval_s: 0,
            step: None,
            hysteresis: None,
            topic: None,
        }
    }

    #[test]
    fn test_contiguous_holding_registers_batch() {
        let params = vec![
            param("a", RegisterType::Holding, 0, 1, DataType::U16),
            param("b", RegisterType::Holding, 1, 1, DataType::U16),
            param("c", RegisterType::Holding, 2, 1, DataType::U16),
        ];
        let plan = plan_node_reads(&params, false, true, 2000, 125);
        assert_eq!(plan.reads.len(), 1);
        assert_eq!(plan.reads[0].count, 3);
        assert!(plan.rejections.is_empty());
    }

    #[test]
    fn test_non_contiguous_splits_blocks() {
        let params = vec![
            param("a", RegisterType::Holding, 0, 1, DataType::U16),
            param("b", RegisterType::Holding, 5, 1, DataType::U16),
        ];
        let plan = plan_node_reads(&params, false, true, 2000, 125);
        assert_eq!(plan.reads.len(), 2);
    }

    #[test]
    fn test_multiword_param_isolated() {
        let params = vec![
            param("a", RegisterType::Holding, 0, 1, DataType::U16),
            param("b", RegisterType::Holding, 1, 2, DataType::U32),
            param("c", RegisterType::Holding, 3, 1, DataType::U16),
        ];
        let plan = plan_node_reads(&params, false, true, 2000, 125);
        assert_eq!(plan.reads.len(), 3);
        assert_eq!(plan.reads[1].count, 2);
    }

    #[test]
    fn test_block_cap_respected() {
        let params: Vec<ParamSpec> = (0..5)
            .map(|i| param(&format!("p{i}"), RegisterType::Holding, i as u32, 1, DataType::U16))
            .collect();
        let plan = plan_node_reads(&params, false, true, 2000, 2);
        assert_eq!(plan.reads.len(), 3);
        assert_eq!(plan.reads[0].count, 2);
        assert_eq!(plan.reads[1].count, 2);
        assert_eq!(plan.reads[2].count, 1);
    }

    #[test]
    fn test_address_overflow_rejected() {
        // normalized address 65535 + 2 words overflows the 0..=65535 wire
        // address space (SPEC_FULL.md §8 boundary case).
        let params = vec![param("bad", RegisterType::Holding, 65535, 2, DataType::U32)];
        let plan = plan_node_reads(&params, false, true, 2000, 125);
        assert_eq!(plan.reads.len(), 0);
        assert_eq!(plan.rejections.len(), 1);
    }

    #[test]
    fn test_batching_disabled_forces_single_reads() {
        let params = vec![
            param("a", RegisterType::Holding, 0, 1, DataType::U16),
            param("b", RegisterType::Holding, 1, 1, DataType::U16),
        ];
        let plan = plan_node_reads(&params, false, false, 2000, 125);
        assert_eq!(plan.reads.len(), 2);
    }
}
