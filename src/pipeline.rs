use anyhow::Result;

/// Implemented by source outputs so the scheduler can observe end-of-stream.
pub trait Token {
    fn is_last(&self) -> bool;
}

impl Token for crate::work::Work {
    fn is_last(&self) -> bool {
        self.is_last()
    }
}

/// A linear chain of typed stages driven by a single loop: per cycle the
/// prehook runs, then the fused stage chain, until the source emits its
/// end-of-stream token. `push` fuses the next stage onto the chain; the
/// compiler enforces that each stage consumes what the previous one
/// produced.
pub struct Pipeline<'a, T> {
    head: Box<dyn FnMut() -> Result<(T, bool)> + 'a>,
    prehook: Box<dyn FnMut() -> Result<()> + 'a>,
    init: Box<dyn FnMut() -> Result<()> + 'a>,
    finalize: Box<dyn FnMut() -> Result<()> + 'a>,
}

pub fn make_pipeline<'a, T: Token + 'a>(
    mut source: impl FnMut() -> Result<T> + 'a,
    prehook: impl FnMut() -> Result<()> + 'a,
    init: impl FnMut() -> Result<()> + 'a,
    finalize: impl FnMut() -> Result<()> + 'a,
) -> Pipeline<'a, T> {
    Pipeline {
        head: Box::new(move || {
            let token = source()?;
            let last = token.is_last();
            Ok((token, last))
        }),
        prehook: Box::new(prehook),
        init: Box::new(init),
        finalize: Box::new(finalize),
    }
}

impl<'a, T: 'a> Pipeline<'a, T> {
    pub fn push<U: 'a>(self, mut stage: impl FnMut(T) -> Result<U> + 'a) -> Pipeline<'a, U> {
        let mut head = self.head;
        Pipeline {
            head: Box::new(move || {
                let (token, last) = head()?;
                Ok((stage(token)?, last))
            }),
            prehook: self.prehook,
            init: self.init,
            finalize: self.finalize,
        }
    }
}

impl<'a> Pipeline<'a, ()> {
    /// Runs the chain until the source signals end-of-stream. The final
    /// cycle still flows through every stage so downstream flushes see it.
    pub fn process(mut self) -> Result<()> {
        (self.init)()?;
        loop {
            (self.prehook)()?;
            let ((), last) = (self.head)()?;
            if last {
                break;
            }
        }
        (self.finalize)()
    }
}
