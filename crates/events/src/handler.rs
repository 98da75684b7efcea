/// Execute an aggregate command in memory: decide, then evolve.
///
/// No persistence or publication happens here; the actor runtime does that.
/// Useful for unit tests and for previewing the state a command would produce.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: larder_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
