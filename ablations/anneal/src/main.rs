//! 退火参数消融实验: 在同一个交叉纤维体模上比较不同的温度设置.

mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .expect("Logger initialization error");

    runner::run().analyze();
}
